//! Single-owner TPM actor.
//!
//! The backend lives on one dedicated thread and executes queued commands
//! one at a time. Callers hold a [`TpmHandle`] whose [`KeyScope`] limits
//! which keys it may touch: the gateway gets the application key, the
//! certification service gets the attestation key and PCRs.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use sovereign_core::config::GatewayConfig;
use sovereign_core::{AppKeyCertificate, Error, HashAlgorithm, Result, SignatureScheme, TpmQuote};

use crate::backend::TpmBackend;

type Job = Box<dyn FnOnce(&mut dyn TpmBackend) + Send>;

/// Which key hierarchy a handle may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// Application key: read public, regenerate, sign
    Application,
    /// Attestation key: certify, quote, PCR operations
    Attestation,
}

/// Handles for the two privilege levels sharing one TPM.
#[derive(Debug)]
pub struct TpmPorts {
    pub gateway: TpmHandle,
    pub certifier: TpmHandle,
}

pub struct TpmActor;

impl TpmActor {
    /// Move `backend` onto its own thread and return scoped handles.
    pub fn spawn<B: TpmBackend>(backend: B, config: &GatewayConfig) -> Result<TpmPorts> {
        let (tx, mut rx) = mpsc::channel::<Job>(config.queue_depth.max(1));
        std::thread::Builder::new()
            .name("tpm-actor".to_string())
            .spawn(move || {
                let mut backend = backend;
                while let Some(job) = rx.blocking_recv() {
                    job(&mut backend);
                }
                info!("TpmActor :: Queue closed :: shutting down");
            })?;
        info!(
            queue_depth = config.queue_depth,
            timeout_ms = config.tpm_timeout_ms,
            "STATUS: TpmActor :: Serialized access point :: ACTIVE"
        );
        let handle = |scope| TpmHandle {
            tx: tx.clone(),
            timeout: config.tpm_timeout(),
            scope,
        };
        Ok(TpmPorts {
            gateway: handle(KeyScope::Application),
            certifier: handle(KeyScope::Attestation),
        })
    }
}

/// Cloneable, scoped sender into the TPM actor.
#[derive(Debug, Clone)]
pub struct TpmHandle {
    tx: mpsc::Sender<Job>,
    timeout: Duration,
    scope: KeyScope,
}

impl TpmHandle {
    pub fn scope(&self) -> KeyScope {
        self.scope
    }

    fn require(&self, scope: KeyScope, op: &str) -> Result<()> {
        if self.scope != scope {
            return Err(Error::CallerNotAllowed(format!(
                "{} requires {:?} scope, handle has {:?}",
                op, scope, self.scope
            )));
        }
        Ok(())
    }

    /// Queue one command and wait for it under the TPM deadline.
    ///
    /// A command whose caller already gave up is skipped by the actor.
    async fn execute<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn TpmBackend) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |backend| {
            if reply_tx.is_closed() {
                debug!(op, "TpmActor :: Skipping abandoned command");
                return;
            }
            let _ = reply_tx.send(f(backend));
        });

        let round_trip = async {
            self.tx
                .send(job)
                .await
                .map_err(|_| Error::HardwareUnavailable("TPM actor stopped".to_string()))?;
            reply_rx
                .await
                .map_err(|_| Error::HardwareUnavailable(format!("{} dropped by TPM actor", op)))?
        };

        match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout = ?self.timeout, "TpmActor :: Operation TIMED OUT");
                Err(Error::HardwareUnavailable(format!(
                    "{} timed out after {:?}",
                    op, self.timeout
                )))
            }
        }
    }

    pub async fn application_key_public(&self) -> Result<String> {
        self.require(KeyScope::Application, "application_key_public")?;
        self.execute("application_key_public", |tpm| tpm.application_key_public())
            .await
    }

    pub async fn create_application_key(&self) -> Result<String> {
        self.require(KeyScope::Application, "create_application_key")?;
        self.execute("create_application_key", |tpm| tpm.create_application_key())
            .await
    }

    pub async fn sign_digest(
        &self,
        digest: Vec<u8>,
        hash_alg: HashAlgorithm,
        scheme: SignatureScheme,
    ) -> Result<Vec<u8>> {
        self.require(KeyScope::Application, "sign_digest")?;
        self.execute("sign_digest", move |tpm| tpm.sign_digest(&digest, hash_alg, scheme))
            .await
    }

    pub async fn attestation_key_public(&self) -> Result<String> {
        self.require(KeyScope::Attestation, "attestation_key_public")?;
        self.execute("attestation_key_public", |tpm| tpm.attestation_key_public())
            .await
    }

    pub async fn endorsement_key_public(&self) -> Result<String> {
        self.require(KeyScope::Attestation, "endorsement_key_public")?;
        self.execute("endorsement_key_public", |tpm| tpm.endorsement_key_public())
            .await
    }

    /// EK signature (DER) over the AK public PEM.
    pub async fn attestation_key_certificate(&self) -> Result<Vec<u8>> {
        self.require(KeyScope::Attestation, "attestation_key_certificate")?;
        self.execute("attestation_key_certificate", |tpm| {
            tpm.attestation_key_certificate()
        })
        .await
    }

    pub async fn certify(
        &self,
        app_key_public: String,
        qualifying_data: Vec<u8>,
    ) -> Result<AppKeyCertificate> {
        self.require(KeyScope::Attestation, "certify")?;
        self.execute("certify", move |tpm| tpm.certify(&app_key_public, &qualifying_data))
            .await
    }

    pub async fn quote(&self, nonce: String, selection: Vec<u8>) -> Result<TpmQuote> {
        self.require(KeyScope::Attestation, "quote")?;
        self.execute("quote", move |tpm| tpm.quote(&nonce, &selection))
            .await
    }

    /// Reset `pcr`, extend `measurement` into it, then quote, as one command
    /// so no other operation can touch the PCR in between.
    pub async fn extend_and_quote(
        &self,
        pcr: u8,
        measurement: [u8; 32],
        nonce: String,
        selection: Vec<u8>,
    ) -> Result<TpmQuote> {
        self.require(KeyScope::Attestation, "extend_and_quote")?;
        self.execute("extend_and_quote", move |tpm| {
            tpm.pcr_reset(pcr)?;
            tpm.pcr_extend(pcr, &measurement)?;
            tpm.quote(&nonce, &selection)
        })
        .await
    }

    /// Reset and extend without quoting.
    pub async fn reset_and_extend(&self, pcr: u8, measurement: [u8; 32]) -> Result<()> {
        self.require(KeyScope::Attestation, "reset_and_extend")?;
        self.execute("reset_and_extend", move |tpm| {
            tpm.pcr_reset(pcr)?;
            tpm.pcr_extend(pcr, &measurement)
        })
        .await
    }
}
