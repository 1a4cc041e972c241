//! Transient and fatal failure handling across the stack.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use sovereign_agent::{BuilderState, HttpAttestationServer};
use sovereign_core::{AttestationServer, Error, HashAlgorithm, SignatureScheme, VerificationFailure};
use sovereign_tpm::SignRequest;

use crate::test_utils::{
    create_workload_key, mobile_sensor, FlakyTpm, Tamper, TamperedCertification, TestCluster,
    TestNode,
};

#[tokio::test]
async fn test_busy_tpm_during_quote_is_retried_with_fresh_nonce() {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    cluster.enroll_via(
        &node,
        TamperedCertification::wrap(
            node.client("verifier"),
            Tamper::BusyQuotes(AtomicU32::new(2)),
        ),
    );

    let agent = cluster.agent_for(&node);
    let credential = agent.attest().await.unwrap();
    assert!(credential.attested_claims().unwrap().unwrap().is_fully_verified());
    // two abandoned challenges remain unspent
    assert_eq!(cluster.engine.nonces().outstanding(), 2);
    assert!(matches!(agent.state().await, BuilderState::Accepted { .. }));
}

#[tokio::test]
async fn test_busy_tpm_beyond_retry_budget_fails_transiently() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", None).await;
    cluster.enroll_via(
        &node,
        TamperedCertification::wrap(
            node.client("verifier"),
            Tamper::BusyQuotes(AtomicU32::new(10)),
        ),
    );

    let err = cluster.agent_for(&node).attest().await.unwrap_err();
    assert!(matches!(err, Error::HardwareUnavailable(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_gateway_retries_busy_signing() {
    let (backend, busy) = FlakyTpm::new(2);
    let node = TestNode::provision_with(backend, "edge-01", None).await;

    let request = SignRequest::digest(vec![9u8; 32], HashAlgorithm::Sha256, SignatureScheme::Ecdsa);
    let signature = node.gateway.sign(&request).await.unwrap();
    assert!(!signature.is_empty());
    assert_eq!(busy.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_busy_tpm_aborts_only_the_handshake() {
    let (backend, busy) = FlakyTpm::new(0);
    let node = TestNode::provision_with(backend, "edge-01", None).await;
    let cluster = TestCluster::new();
    cluster.enroll(&node);
    let signer = cluster.agent_for(&node).attest_and_bind().await.unwrap();

    busy.store(1, Ordering::SeqCst);
    let err = signer.sign(&[3u8; 32], SignatureScheme::Ecdsa).await.unwrap_err();
    assert!(matches!(err, Error::HardwareUnavailable(_)));

    // next handshake goes through on the same credential
    assert!(signer.sign(&[4u8; 32], SignatureScheme::Ecdsa).await.is_ok());
}

#[tokio::test]
async fn test_geolocation_fetch_failure_is_fatal() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    cluster.enroll_via(
        &node,
        TamperedCertification::wrap(node.client("verifier"), Tamper::GeolocationUnavailable),
    );

    let message = cluster.message_for(&node).await;
    let err = cluster.orchestrator.attest(message).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert!(err.verification_failure().is_none());
}

#[tokio::test]
async fn test_slow_node_times_out_and_keeps_nonce() {
    let cluster = TestCluster::with_timeout(Duration::from_millis(100));
    let node = TestNode::provision("edge-01", None).await;
    cluster.enroll_via(
        &node,
        TamperedCertification::wrap(
            node.client("verifier"),
            Tamper::Stall(Duration::from_millis(500)),
        ),
    );

    let message = cluster.message_for(&node).await;
    let err = cluster.orchestrator.attest(message.clone()).await.unwrap_err();
    assert!(matches!(err, Error::VerifierTimeout(_)));
    assert!(err.is_transient());
    assert!(cluster.engine.nonces().check(&message.session()).is_ok());
}

#[tokio::test]
async fn test_agent_and_server_over_http() {
    let _ = tracing_subscriber::fmt::try_init();

    tracing::info!("Step 1: Serve the identity server on an ephemeral port");
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    cluster.enroll(&node);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let app = sovereign_server::http::router(cluster.orchestrator.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    tracing::info!("Step 2: Attest through the HTTP client");
    let server = Arc::new(
        HttpAttestationServer::new(format!("http://{}", addr), Duration::from_secs(5)).unwrap(),
    );
    let agent = cluster.agent_with_server(&node, server.clone());
    let credential = agent.attest().await.unwrap();
    assert!(credential.attested_claims().unwrap().unwrap().geolocation.is_some());

    tracing::info!("Step 3: Request a workload credential");
    let chain = server
        .request_workload_credential("ingest-worker", &create_workload_key(), &credential)
        .await
        .unwrap();
    assert_eq!(chain.agent, credential);
    chain.validate(sovereign_core::current_timestamp()).unwrap();

    tracing::info!("Step 4: Replay the spent challenge over the wire");
    let message = cluster.message_for(&node).await;
    server.attest(message.clone()).await.unwrap();
    let err = server.attest(message).await.unwrap_err();
    assert_eq!(
        err.verification_failure(),
        Some(&VerificationFailure::NonceReused)
    );
    assert!(!err.is_transient());
}
