//! HTTP surface of the identity server.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use sovereign_core::services::{ATTEST_PATH, NONCE_PATH, WORKLOAD_PATH};
use sovereign_core::{
    AgentCredential, AttestationMessage, AttestationServer, ChallengeNonce, ChallengeRequest,
    CredentialChain, WorkloadRequest,
};
use sovereign_tpm::http::ApiError;

use crate::orchestrator::AttestationOrchestrator;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(orchestrator: Arc<AttestationOrchestrator>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(NONCE_PATH, post(issue_nonce))
        .route(ATTEST_PATH, post(attest))
        .route(WORKLOAD_PATH, post(workload))
        .layer(middleware::from_fn(request_id))
        .with_state(orchestrator)
}

async fn request_id(request: Request, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    let span = info_span!("request", request_id = %id, path = %request.uri().path());
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn health_check(State(orchestrator): State<Arc<AttestationOrchestrator>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "attestation-server",
        "trust_domain": orchestrator.composer().root().subject,
    }))
}

async fn issue_nonce(
    State(orchestrator): State<Arc<AttestationOrchestrator>>,
    Json(request): Json<ChallengeRequest>,
) -> Result<Json<ChallengeNonce>, ApiError> {
    Ok(Json(orchestrator.request_nonce(&request.agent_id).await?))
}

async fn attest(
    State(orchestrator): State<Arc<AttestationOrchestrator>>,
    Json(message): Json<AttestationMessage>,
) -> Result<Json<AgentCredential>, ApiError> {
    Ok(Json(orchestrator.attest(message).await?))
}

async fn workload(
    State(orchestrator): State<Arc<AttestationOrchestrator>>,
    Json(request): Json<WorkloadRequest>,
) -> Result<Json<CredentialChain>, ApiError> {
    Ok(Json(orchestrator.issue_workload_credential(&request)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{create_test_message, create_test_orchestrator};
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use sovereign_core::config::CapabilityConfig;
    use sovereign_core::{Capability, Rejection};
    use tower::ServiceExt;

    fn post_json(path: &str, body: String) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_nonce_and_attest() {
        let (orchestrator, node) = create_test_orchestrator(CapabilityConfig::default().enabled).await;
        let orchestrator = Arc::new(orchestrator);
        let app = router(orchestrator.clone());

        let response = app
            .clone()
            .oneshot(post_json(NONCE_PATH, json!({"agent_id": "agent-001"}).to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        let nonce: ChallengeNonce = body_json(response).await;
        assert_eq!(nonce.value.len(), 64);

        let message = create_test_message(&orchestrator, &node).await;
        let response = app
            .clone()
            .oneshot(post_json(ATTEST_PATH, serde_json::to_string(&message).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let credential: AgentCredential = body_json(response).await;
        assert!(credential.attested_claims().unwrap().is_some());

        // replay
        let response = app
            .oneshot(post_json(ATTEST_PATH, serde_json::to_string(&message).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let rejection: Rejection = body_json(response).await;
        assert_eq!(rejection.code, "NonceReused");
        assert!(!rejection.retryable);
    }

    #[tokio::test]
    async fn test_tampered_certificate_is_403() {
        let (orchestrator, node) = create_test_orchestrator(CapabilityConfig::default().enabled).await;
        let orchestrator = Arc::new(orchestrator);
        let mut message = create_test_message(&orchestrator, &node).await;
        message.app_key_certificate.certify_data[12] ^= 0x80;

        let response = router(orchestrator)
            .oneshot(post_json(ATTEST_PATH, serde_json::to_string(&message).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let rejection: Rejection = body_json(response).await;
        assert_eq!(rejection.code, "CertSignatureInvalid");
    }

    #[tokio::test]
    async fn test_disabled_attestor_is_403() {
        let (orchestrator, _) = create_test_orchestrator(vec![Capability::CredentialComposer]).await;
        let response = router(Arc::new(orchestrator))
            .oneshot(post_json(NONCE_PATH, json!({"agent_id": "agent-001"}).to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let rejection: Rejection = body_json(response).await;
        assert_eq!(rejection.code, "Unsupported");
    }
}
