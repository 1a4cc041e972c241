//! Credential composition: agent claims, workload scoping and transport binding.

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;

use sovereign_core::crypto::{parse_public_key_pem, sha256};
use sovereign_core::{
    current_timestamp, Credential, Error, Extension, SignatureScheme, WorkloadCredential,
    WorkloadRequest, ATTESTED_CLAIMS_OID,
};
use sovereign_tpm::TransportSigner;

use crate::test_utils::{create_workload_key, mobile_sensor, TestCluster, TestNode};

#[tokio::test]
async fn test_embedded_claims_are_verifier_output_verbatim() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    cluster.enroll(&node);

    let message = cluster.message_for(&node).await;
    let claims = cluster.engine.verify(&message).await.unwrap();
    let credential = cluster
        .orchestrator
        .composer()
        .compose_agent_credential("edge-01", &claims, &message.app_key_public)
        .unwrap();

    assert_eq!(
        credential.claims_bytes().unwrap(),
        claims.to_bytes().unwrap().as_slice()
    );
    assert_eq!(credential.attested_claims().unwrap(), Some(claims));
}

#[tokio::test]
async fn test_workload_credential_carries_no_hardware_evidence() {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    cluster.enroll(&node);
    let agent = cluster.agent_for(&node).attest().await.unwrap();

    let chain = cluster
        .orchestrator
        .issue_workload_credential(&WorkloadRequest {
            workload_id: "ingest-worker".to_string(),
            public_key: create_workload_key(),
            agent_credential: agent.clone(),
        })
        .unwrap();

    let workload = chain.workload.credential();
    assert!(workload.extension(ATTESTED_CLAIMS_OID).is_none());
    let serialized = serde_json::to_string(workload).unwrap();
    assert!(!serialized.contains("12d1:1433"));
    assert!(!serialized.contains("356345043865103"));
    assert_eq!(workload.issuer, agent.credential().subject);
    assert!(workload.not_after <= agent.credential().not_after);
    chain.validate(current_timestamp()).unwrap();

    // the root, not the workload, anchors trust
    let [_, _, root] = chain.as_list();
    assert_eq!(root.subject, cluster.orchestrator.composer().root().subject);
}

#[tokio::test]
async fn test_workload_credential_refuses_smuggled_claims() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    cluster.enroll(&node);
    let agent = cluster.agent_for(&node).attest().await.unwrap();

    // an agent credential relabelled as a workload credential
    assert!(WorkloadCredential::new(agent.credential().clone()).is_err());

    // claims hidden under another extension id
    let mut smuggled: Credential = agent.credential().clone();
    smuggled.extensions.retain(|e| e.oid != ATTESTED_CLAIMS_OID);
    smuggled.extensions.push(Extension {
        oid: "1.3.6.1.4.1.99999.9".to_string(),
        critical: false,
        value: agent.claims_bytes().unwrap().to_vec(),
    });
    assert!(WorkloadCredential::new(smuggled).is_err());
}

#[tokio::test]
async fn test_workload_from_unattested_credential_is_refused() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", None).await;
    cluster.enroll(&node);
    let agent = cluster.agent_for(&node).attest().await.unwrap();

    // strip the claims: the signature no longer covers the credential
    let mut stripped = agent.credential().clone();
    stripped.extensions.retain(|e| e.oid != ATTESTED_CLAIMS_OID);
    let result = cluster
        .orchestrator
        .issue_workload_credential(&WorkloadRequest {
            workload_id: "ingest-worker".to_string(),
            public_key: create_workload_key(),
            agent_credential: sovereign_core::AgentCredential::new(stripped),
        });
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
}

#[tokio::test]
async fn test_transport_signing_uses_attested_key() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", None).await;
    cluster.enroll(&node);

    let agent = cluster.agent_for(&node);
    let signer = agent.attest_and_bind().await.unwrap();
    let digest = sha256(b"client-hello || server-hello || certificate");
    let der = signer.sign(&digest, SignatureScheme::Ecdsa).await.unwrap();

    let key = parse_public_key_pem(&signer.credential().credential().public_key).unwrap();
    key.verify_prehash(&digest, &Signature::from_der(&der).unwrap())
        .unwrap();
}

#[tokio::test]
async fn test_credential_for_other_key_cannot_bind() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", None).await;
    let other = TestNode::provision("edge-02", None).await;
    cluster.enroll(&node);
    cluster.enroll(&other);

    let foreign = cluster.agent_for(&other).attest().await.unwrap();
    assert!(TransportSigner::bind(node.gateway.clone(), foreign).await.is_err());
}
