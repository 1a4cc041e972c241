//! Identity server orchestration: nonce issue, verification, composition.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, info_span, Instrument};

use sovereign_core::{
    AgentCredential, AttestationMessage, AttestationServer, Capability, ChallengeNonce,
    CredentialChain, Result, WorkloadRequest,
};
use sovereign_verifier::VerificationEngine;

use crate::capability::CapabilitySet;
use crate::composer::{validate_id, CredentialComposer};

pub struct AttestationOrchestrator {
    engine: Arc<VerificationEngine>,
    composer: CredentialComposer,
    capabilities: CapabilitySet,
}

impl AttestationOrchestrator {
    pub fn new(
        engine: Arc<VerificationEngine>,
        composer: CredentialComposer,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            engine,
            composer,
            capabilities,
        }
    }

    pub fn composer(&self) -> &CredentialComposer {
        &self.composer
    }

    pub fn issue_workload_credential(&self, request: &WorkloadRequest) -> Result<CredentialChain> {
        self.capabilities.require(Capability::CredentialComposer)?;
        self.composer.compose_workload_credential(
            &request.workload_id,
            &request.public_key,
            &request.agent_credential,
        )
    }
}

#[async_trait]
impl AttestationServer for AttestationOrchestrator {
    async fn request_nonce(&self, agent_id: &str) -> Result<ChallengeNonce> {
        self.capabilities.require(Capability::NodeAttestor)?;
        validate_id(agent_id)?;
        self.engine.issue_nonce(agent_id)
    }

    async fn attest(&self, message: AttestationMessage) -> Result<AgentCredential> {
        self.capabilities.require(Capability::NodeAttestor)?;
        // Checked up front so a verification never spends a nonce it cannot use.
        self.capabilities.require(Capability::CredentialComposer)?;
        validate_id(&message.agent_id)?;

        let span = info_span!("attest", session = %message.session());
        async {
            let claims = self.engine.verify(&message).await?;
            let credential = self.composer.compose_agent_credential(
                &message.agent_id,
                &claims,
                &message.app_key_public,
            )?;
            info!(agent_id = %message.agent_id, "AttestationOrchestrator :: Node Attested");
            Ok(credential)
        }
        .instrument(span)
        .await
    }
}
