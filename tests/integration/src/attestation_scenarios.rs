//! Verification outcomes for honest and tampered hosts.

use std::sync::Arc;

use sovereign_core::{AttestationServer, Error, SensorType, VerificationFailure};
use sovereign_tpm::SoftwareTpm;

use crate::test_utils::{
    gnss_sensor, mobile_sensor, Tamper, TamperedCertification, TestCluster, TestNode,
};

fn failure(err: &Error) -> VerificationFailure {
    match err.verification_failure() {
        Some(kind) => kind.clone(),
        None => panic!("expected a verification failure, got {:?}", err),
    }
}

#[tokio::test]
async fn test_honest_node_is_attested() {
    let _ = tracing_subscriber::fmt::try_init();

    tracing::info!("Step 1: Provision node and enroll it with the identity server");
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    cluster.enroll(&node);

    tracing::info!("Step 2: Run one attestation cycle from the agent");
    let agent = cluster.agent_for(&node);
    let credential = agent.attest().await.unwrap();

    tracing::info!("Step 3: Inspect the embedded claims");
    let claims = credential.attested_claims().unwrap().unwrap();
    assert!(claims.hardware_attestation.quote_verified);
    assert!(claims.hardware_attestation.app_key_certified);
    let geolocation = claims.geolocation.unwrap();
    assert_eq!(geolocation.sensor_type, SensorType::Mobile);
    assert_eq!(geolocation.sensor_id, "12d1:1433");
    assert_eq!(geolocation.pcr_index, 15);
    assert_eq!(credential.credential().public_key, node.app_key().await);
    assert_eq!(
        credential.credential().subject,
        "spiffe://example.org/agent/edge-01"
    );
}

#[tokio::test]
async fn test_node_without_sensor_is_attested_without_geolocation() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-02", None).await;
    cluster.enroll(&node);

    let credential = cluster.agent_for(&node).attest().await.unwrap();
    let claims = credential.attested_claims().unwrap().unwrap();
    assert!(claims.hardware_attestation.quote_verified);
    assert!(claims.geolocation.is_none());
}

#[tokio::test]
async fn test_gnss_claim_carries_no_subscriber_ids() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-03", Some(gnss_sensor())).await;
    cluster.enroll(&node);

    let credential = cluster.agent_for(&node).attest().await.unwrap();
    let geolocation = credential.attested_claims().unwrap().unwrap().geolocation.unwrap();
    assert_eq!(geolocation.sensor_type, SensorType::Gnss);
    assert!(geolocation.sensor_imei.is_none());
    assert!(geolocation.sensor_imsi.is_none());
}

#[tokio::test]
async fn test_flipped_certify_bit_is_rejected() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    cluster.enroll(&node);

    let mut message = cluster.message_for(&node).await;
    let last = message.app_key_certificate.certify_data.len() - 1;
    message.app_key_certificate.certify_data[last] ^= 0x01;

    let err = cluster.orchestrator.attest(message.clone()).await.unwrap_err();
    assert_eq!(failure(&err), VerificationFailure::CertSignatureInvalid);
    assert!(!err.is_transient());
    // nothing was spent on a forged message
    assert!(cluster.engine.nonces().check(&message.session()).is_ok());
}

#[tokio::test]
async fn test_quote_over_other_nonce_is_rejected() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    let other = "5f".repeat(32);
    cluster.enroll_via(
        &node,
        TamperedCertification::wrap(node.client("verifier"), Tamper::QuoteNonce(other)),
    );

    let message = cluster.message_for(&node).await;
    let err = cluster.orchestrator.attest(message).await.unwrap_err();
    assert_eq!(failure(&err), VerificationFailure::NonceMismatch);
}

#[tokio::test]
async fn test_geolocation_altered_after_extension_is_rejected() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    cluster.enroll_via(
        &node,
        TamperedCertification::wrap(node.client("verifier"), Tamper::AlteredGeolocation),
    );

    let message = cluster.message_for(&node).await;
    let err = cluster.orchestrator.attest(message.clone()).await.unwrap_err();
    assert_eq!(failure(&err), VerificationFailure::GeolocationVerificationFailed);

    // The certificate and quote alone would have passed.
    let honest = TestCluster::new();
    honest.enroll(&node);
    let message = honest.message_for(&node).await;
    assert!(honest.engine.verify(&message).await.is_ok());
}

#[tokio::test]
async fn test_unregistered_agent_is_rejected() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("ghost-01", None).await;

    let err = cluster.agent_for(&node).attest().await.unwrap_err();
    assert_eq!(failure(&err), VerificationFailure::AgentNotFound);
}

#[tokio::test]
async fn test_certificate_from_other_tpm_is_rejected() {
    let cluster = TestCluster::new();
    let enrolled = TestNode::provision("edge-01", None).await;
    let impostor = TestNode::provision("edge-01", None).await;
    cluster.enroll(&enrolled);

    // impostor signs with its own AK, registry holds the enrolled AK
    let nonce = cluster.orchestrator.request_nonce("edge-01").await.unwrap();
    let certificate = cluster.certify(&impostor, &nonce.value).await;
    let message = sovereign_core::AttestationMessage {
        app_key_public: impostor.app_key().await,
        app_key_certificate: certificate,
        challenge_nonce: nonce.value,
        agent_id: "edge-01".to_string(),
        quote: Vec::new(),
    };
    let err = cluster.orchestrator.attest(message).await.unwrap_err();
    assert_eq!(failure(&err), VerificationFailure::CertSignatureInvalid);
}

#[tokio::test]
async fn test_restarted_node_keeps_its_registry_record() {
    let _ = tracing_subscriber::fmt::try_init();

    tracing::info!("Step 1: First boot creates the key store; enroll the published AK");
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("tpm-keys.json");
    let cluster = TestCluster::new();
    let first_boot = TestNode::provision_with(
        SoftwareTpm::load_or_provision(&store).unwrap(),
        "edge-01",
        Some(mobile_sensor()),
    )
    .await;
    let published = first_boot.service.attestation_key().await.unwrap();
    assert_eq!(published.ak_public, first_boot.ak_public);
    cluster.enroll(&first_boot);
    cluster.agent_for(&first_boot).attest().await.unwrap();
    drop(first_boot);

    tracing::info!("Step 2: Restart from the same store; the registry is untouched");
    let restarted = TestNode::provision_with(
        SoftwareTpm::load_or_provision(&store).unwrap(),
        "edge-01",
        Some(mobile_sensor()),
    )
    .await;
    cluster
        .connector
        .register("edge-01", restarted.client("verifier"))
        .unwrap();
    let credential = cluster.agent_for(&restarted).attest().await.unwrap();
    assert_eq!(credential.credential().public_key, restarted.app_key().await);

    tracing::info!("Step 3: A node that lost its store no longer matches the record");
    let reprovisioned = TestNode::provision("edge-01", None).await;
    cluster
        .connector
        .register("edge-01", reprovisioned.client("verifier"))
        .unwrap();
    let err = cluster.agent_for(&reprovisioned).attest().await.unwrap_err();
    assert_eq!(failure(&err), VerificationFailure::CertSignatureInvalid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_agents_receive_own_claims() {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = Arc::new(TestCluster::new());
    let mobile = TestNode::provision("edge-mobile", Some(mobile_sensor())).await;
    let gnss = TestNode::provision("edge-gnss", Some(gnss_sensor())).await;
    cluster.enroll(&mobile);
    cluster.enroll(&gnss);

    let mobile_agent = cluster.agent_for(&mobile);
    let gnss_agent = cluster.agent_for(&gnss);
    let (mobile_result, gnss_result) = tokio::join!(mobile_agent.attest(), gnss_agent.attest());

    let mobile_credential = mobile_result.unwrap();
    let gnss_credential = gnss_result.unwrap();
    let mobile_claims = mobile_credential.attested_claims().unwrap().unwrap();
    let gnss_claims = gnss_credential.attested_claims().unwrap().unwrap();

    assert_eq!(mobile_claims.geolocation.unwrap().sensor_id, "12d1:1433");
    assert_eq!(gnss_claims.geolocation.unwrap().sensor_id, "1546:01a8");
    assert_eq!(mobile_credential.credential().public_key, mobile.app_key().await);
    assert_eq!(gnss_credential.credential().public_key, gnss.app_key().await);
    assert_ne!(
        mobile_credential.credential().subject,
        gnss_credential.credential().subject
    );
}
