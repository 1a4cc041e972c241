//! Nonce binding and single use.

use proptest::prelude::*;
use tokio::task::JoinSet;

use sovereign_core::{AttestationMessage, AttestationServer, Error, VerificationFailure};

use crate::test_utils::{mobile_sensor, Tamper, TamperedCertification, TestCluster, TestNode};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replay_has_one_winner() {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", Some(mobile_sensor())).await;
    cluster.enroll(&node);
    let message = cluster.message_for(&node).await;

    let mut racers = JoinSet::new();
    for _ in 0..8 {
        let orchestrator = cluster.orchestrator.clone();
        let message = message.clone();
        racers.spawn(async move { orchestrator.attest(message).await });
    }

    let mut issued = 0;
    while let Some(outcome) = racers.join_next().await {
        match outcome.unwrap() {
            Ok(_) => issued += 1,
            Err(e) => assert_eq!(
                e.verification_failure(),
                Some(&VerificationFailure::NonceReused),
                "unexpected loser outcome: {:?}",
                e
            ),
        }
    }
    assert_eq!(issued, 1);
}

#[tokio::test]
async fn test_nonce_issued_to_other_agent_is_refused() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", None).await;
    cluster.enroll(&node);

    let foreign = cluster.orchestrator.request_nonce("edge-02").await.unwrap();
    let message = AttestationMessage {
        app_key_public: node.app_key().await,
        app_key_certificate: cluster.certify(&node, &foreign.value).await,
        challenge_nonce: foreign.value,
        agent_id: "edge-01".to_string(),
        quote: Vec::new(),
    };
    let err = cluster.orchestrator.attest(message).await.unwrap_err();
    assert_eq!(
        err.verification_failure(),
        Some(&VerificationFailure::NonceMismatch)
    );
}

#[tokio::test]
async fn test_never_issued_nonce_is_refused() {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", None).await;
    cluster.enroll(&node);

    let invented = "ab".repeat(32);
    let message = AttestationMessage {
        app_key_public: node.app_key().await,
        app_key_certificate: cluster.certify(&node, &invented).await,
        challenge_nonce: invented,
        agent_id: "edge-01".to_string(),
        quote: Vec::new(),
    };
    let err = cluster.orchestrator.attest(message).await.unwrap_err();
    assert_eq!(
        err.verification_failure(),
        Some(&VerificationFailure::NonceUnknown)
    );
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Certificate over `certified_nonce` presented under a different challenge.
/// `None` when the generated nonce collides with the issued one.
async fn certificate_for_other_nonce(certified_nonce: String) -> Option<Result<(), Error>> {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", None).await;
    cluster.enroll(&node);

    let mut message = cluster.message_for(&node).await;
    if certified_nonce == message.challenge_nonce {
        return None;
    }
    message.app_key_certificate = cluster.certify(&node, &certified_nonce).await;
    let session = message.session();
    let result = cluster.orchestrator.attest(message).await.map(|_| ());
    // a mismatched certificate must not burn the challenge
    assert!(cluster.engine.nonces().check(&session).is_ok());
    Some(result)
}

/// Honest certificate, quote taken over `quoted_nonce`.
async fn quote_for_other_nonce(quoted_nonce: String) -> Option<Result<(), Error>> {
    let cluster = TestCluster::new();
    let node = TestNode::provision("edge-01", None).await;
    cluster.enroll_via(
        &node,
        TamperedCertification::wrap(
            node.client("verifier"),
            Tamper::QuoteNonce(quoted_nonce.clone()),
        ),
    );

    let message = cluster.message_for(&node).await;
    if quoted_nonce == message.challenge_nonce {
        return None;
    }
    Some(cluster.orchestrator.attest(message).await.map(|_| ()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_certificate_for_other_nonce_never_verifies(nonce in "[0-9a-f]{64}") {
        if let Some(result) = runtime().block_on(certificate_for_other_nonce(nonce)) {
            let err = result.err();
            prop_assert_eq!(
                err.as_ref().and_then(Error::verification_failure),
                Some(&VerificationFailure::QualifyingDataMismatch)
            );
        }
    }

    #[test]
    fn prop_quote_for_other_nonce_never_verifies(nonce in "[0-9a-f]{64}") {
        if let Some(result) = runtime().block_on(quote_for_other_nonce(nonce)) {
            let err = result.err();
            prop_assert_eq!(
                err.as_ref().and_then(Error::verification_failure),
                Some(&VerificationFailure::NonceMismatch)
            );
        }
    }
}
