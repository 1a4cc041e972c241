//! HTTP surface of the Delegated Certification Service.
//!
//! The caller identity is the peer IP; allow-list and rate-limit failures
//! surface as 403 and 429.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use sovereign_core::{AttestationKeyResponse, CertifyResponse, Error, QuoteResponse, Rejection};

use crate::certification::DelegatedCertificationService;

pub const CERTIFY_PATH: &str = "/v1/delegated_certification/certify_app_key";
pub const QUOTE_PATH: &str = "/v1/quote";
pub const GEOLOCATION_PATH: &str = "/v1/attested_geolocation";
pub const ATTESTATION_KEY_PATH: &str = "/v1/attestation_key";

/// Rejection code of the 404 sent when the host has no location sensor.
pub const NO_SENSOR_CODE: &str = "NoSensor";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertifyAppKeyRequest {
    pub app_key_public: String,
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceRequest {
    pub nonce: String,
}

/// Error wrapper rendering a [`sovereign_core::Rejection`] body.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let rejection = self.0.to_rejection();
        let mut response = (status, Json(&rejection)).into_response();
        if let Some(secs) = rejection.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub fn router(service: Arc<DelegatedCertificationService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(ATTESTATION_KEY_PATH, get(attestation_key))
        .route(CERTIFY_PATH, post(certify_app_key))
        .route(QUOTE_PATH, post(quote))
        .route(GEOLOCATION_PATH, post(attested_geolocation))
        .with_state(service)
}

async fn health_check(State(service): State<Arc<DelegatedCertificationService>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "delegated-certification",
        "agent_id": service.agent_id(),
    }))
}

async fn attestation_key(
    State(service): State<Arc<DelegatedCertificationService>>,
) -> Result<Json<AttestationKeyResponse>, ApiError> {
    Ok(Json(service.attestation_key().await?))
}

async fn certify_app_key(
    State(service): State<Arc<DelegatedCertificationService>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<CertifyAppKeyRequest>,
) -> Result<Json<CertifyResponse>, ApiError> {
    let response = service
        .certify_application_key(&peer.ip().to_string(), &request.app_key_public, &request.nonce)
        .await?;
    Ok(Json(response))
}

async fn quote(
    State(service): State<Arc<DelegatedCertificationService>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<NonceRequest>,
) -> Result<Json<QuoteResponse>, ApiError> {
    let response = service
        .get_quote(&peer.ip().to_string(), &request.nonce)
        .await?;
    Ok(Json(response))
}

async fn attested_geolocation(
    State(service): State<Arc<DelegatedCertificationService>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<NonceRequest>,
) -> Result<Response, ApiError> {
    match service
        .get_attested_geolocation(&peer.ip().to_string(), &request.nonce)
        .await?
    {
        Some(claim) => Ok(Json(claim).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(Rejection {
                code: NO_SENSOR_CODE.to_string(),
                retryable: false,
                message: "no location sensor present".to_string(),
                failure: None,
                retry_after_secs: None,
            }),
        )
            .into_response()),
    }
}
