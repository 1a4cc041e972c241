//! Attestation agent: drives the builder through one cycle per call and
//! retries transient failures with a fresh nonce each time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use sovereign_core::config::AgentConfig;
use sovereign_core::{
    current_timestamp, AgentCredential, AttestationMessage, AttestationServer,
    CertificationService, ChallengeNonce, Error, Result,
};
use sovereign_tpm::{HardwareKeyGateway, TransportSigner};

use crate::state::{AttestationBuilder, BuilderState};

pub struct AttestationAgent {
    agent_id: String,
    gateway: Arc<HardwareKeyGateway>,
    certification: Arc<dyn CertificationService>,
    server: Arc<dyn AttestationServer>,
    config: AgentConfig,
    builder: Mutex<AttestationBuilder>,
    signer: RwLock<Option<Arc<TransportSigner>>>,
}

impl AttestationAgent {
    pub fn new(
        gateway: Arc<HardwareKeyGateway>,
        certification: Arc<dyn CertificationService>,
        server: Arc<dyn AttestationServer>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            agent_id: config.agent_id.clone(),
            gateway,
            certification,
            server,
            config: config.clone(),
            builder: Mutex::new(AttestationBuilder::new(&config.agent_id)),
            signer: RwLock::new(None),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub async fn state(&self) -> BuilderState {
        self.builder.lock().await.current_state().clone()
    }

    /// Run one attestation cycle to completion or to a terminal failure.
    pub async fn attest(&self) -> Result<AgentCredential> {
        let mut builder = self.builder.lock().await;
        let deadline = self.config.cycle_deadline();
        let span = info_span!("attestation_cycle", agent_id = %self.agent_id, cycle = %Uuid::new_v4());

        let outcome = tokio::time::timeout(deadline, self.attest_with_retry(&mut builder))
            .instrument(span)
            .await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                builder.abort("cycle deadline exceeded");
                error!(agent_id = %self.agent_id, ?deadline, "AttestationAgent :: Cycle deadline EXCEEDED");
                Err(Error::VerifierTimeout(format!(
                    "attestation cycle exceeded {:?}",
                    deadline
                )))
            }
        }
    }

    /// Attest and bind the issued credential to the TPM application key.
    pub async fn attest_and_bind(&self) -> Result<Arc<TransportSigner>> {
        let credential = self.attest().await?;
        let signer = Arc::new(TransportSigner::bind(self.gateway.clone(), credential).await?);
        *self.signer.write().await = Some(signer.clone());
        Ok(signer)
    }

    /// Signer for the most recently issued credential.
    pub async fn transport_signer(&self) -> Option<Arc<TransportSigner>> {
        self.signer.read().await.clone()
    }

    /// Keep a valid credential until `shutdown` resolves, renewing at half
    /// of each credential's validity window.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let pause = match self.attest_and_bind().await {
                Ok(signer) => {
                    let credential = signer.credential().credential();
                    let remaining = credential.not_after.saturating_sub(current_timestamp());
                    Duration::from_millis(remaining / 2)
                }
                Err(e) => {
                    error!(agent_id = %self.agent_id, code = e.code(), error = %e, "AttestationAgent :: Attestation FAILED");
                    self.config.backoff().max(Duration::from_secs(1)) * self.config.max_attempts.max(1)
                }
            };
            tokio::select! {
                _ = &mut shutdown => {
                    info!(agent_id = %self.agent_id, "AttestationAgent :: Shutdown");
                    return;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn attest_with_retry(&self, builder: &mut AttestationBuilder) -> Result<AgentCredential> {
        let mut attempts = 1u32;
        let mut throttled = 0u32;
        loop {
            let err = match self.run_cycle(builder).await {
                Ok(credential) => return Ok(credential),
                Err(e) => e,
            };
            match &err {
                Error::RateLimited { retry_after, .. } => {
                    if throttled >= self.config.rate_limit_retries
                        || *retry_after > self.config.max_rate_limit_wait()
                    {
                        return Err(err);
                    }
                    throttled += 1;
                    warn!(retry_after_ms = retry_after.as_millis() as u64, "AttestationAgent :: Throttled :: waiting");
                    tokio::time::sleep(*retry_after).await;
                }
                e if e.is_transient() && attempts < self.config.max_attempts => {
                    warn!(attempt = attempts, code = e.code(), error = %e, "AttestationAgent :: Transient failure :: retrying with fresh nonce");
                    tokio::time::sleep(self.config.backoff() * attempts).await;
                    attempts += 1;
                }
                _ => return Err(err),
            }
        }
    }

    async fn run_cycle(&self, builder: &mut AttestationBuilder) -> Result<AgentCredential> {
        builder.reset();
        let nonce = self.server.request_nonce(&self.agent_id).await?;
        builder.on_nonce_received(nonce.clone())?;

        let message = match self.assemble(builder, &nonce).await {
            Ok(message) => message,
            Err(e) => {
                builder.abort(e.code());
                return Err(e);
            }
        };
        let app_key_public = message.app_key_public.clone();
        builder.on_sent()?;
        debug!(session = %message.session(), "AttestationAgent :: Message Sent");

        match self.server.attest(message).await {
            Ok(credential) => {
                if credential.credential().public_key.trim() != app_key_public.trim() {
                    let e = Error::InvalidState(
                        "issued credential does not carry the attested application key".to_string(),
                    );
                    builder.on_rejected(&e)?;
                    return Err(e);
                }
                builder.on_accepted(&credential)?;
                info!(
                    subject = %credential.credential().subject,
                    serial = %credential.credential().serial,
                    "AttestationAgent :: Credential ISSUED"
                );
                Ok(credential)
            }
            Err(e) => {
                builder.on_rejected(&e)?;
                warn!(code = e.code(), retryable = e.is_transient(), "AttestationAgent :: Attestation REJECTED");
                Err(e)
            }
        }
    }

    async fn assemble(
        &self,
        builder: &mut AttestationBuilder,
        nonce: &ChallengeNonce,
    ) -> Result<AttestationMessage> {
        let app_key_public = self.gateway.application_key_public().await?;
        builder.on_app_key(app_key_public.clone())?;
        let certified = self
            .certification
            .certify_application_key(&app_key_public, &nonce.value)
            .await?;
        builder.on_certified(certified)
    }
}
