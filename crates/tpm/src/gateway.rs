//! Hardware Key & Evidence Gateway.
//!
//! The only component that signs with the application key. It regenerates
//! the key on start, signs digests for the agent and the transport layer,
//! and forwards quote requests to the certification service because it has
//! no attestation-key access of its own.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use sovereign_core::config::GatewayConfig;
use sovereign_core::types::b64;
use sovereign_core::{
    CertificationService, Error, HashAlgorithm, Result, SignatureScheme, TpmQuote,
};

use crate::actor::{KeyScope, TpmHandle};

/// Local signing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    #[serde(with = "b64")]
    pub digest_or_data: Vec<u8>,
    pub hash_alg: HashAlgorithm,
    /// `false` means the gateway hashes `digest_or_data` first
    pub is_digest: bool,
    pub scheme: SignatureScheme,
}

impl SignRequest {
    pub fn digest(digest: Vec<u8>, hash_alg: HashAlgorithm, scheme: SignatureScheme) -> Self {
        Self {
            digest_or_data: digest,
            hash_alg,
            is_digest: true,
            scheme,
        }
    }

    fn prepared_digest(&self) -> Result<Vec<u8>> {
        if self.is_digest {
            if self.digest_or_data.len() != self.hash_alg.digest_len() {
                return Err(Error::InvalidRequest(format!(
                    "digest is {} bytes, {:?} needs {}",
                    self.digest_or_data.len(),
                    self.hash_alg,
                    self.hash_alg.digest_len()
                )));
            }
            Ok(self.digest_or_data.clone())
        } else {
            Ok(self.hash_alg.digest(&self.digest_or_data))
        }
    }
}

pub struct HardwareKeyGateway {
    tpm: TpmHandle,
    certifier: Option<Arc<dyn CertificationService>>,
    max_retries: u32,
    backoff: Duration,
}

impl HardwareKeyGateway {
    /// Generate a fresh application key and return the running gateway.
    pub async fn start(tpm: TpmHandle, config: &GatewayConfig) -> Result<Self> {
        if tpm.scope() != KeyScope::Application {
            return Err(Error::Config(
                "gateway requires an application-key handle".to_string(),
            ));
        }
        let gateway = Self {
            tpm,
            certifier: None,
            max_retries: config.max_hardware_retries,
            backoff: config.retry_backoff(),
        };
        gateway
            .with_retry("create_application_key", || gateway.tpm.create_application_key())
            .await?;
        info!("STATUS: HardwareKeyGateway :: Application Key :: REGENERATED");
        Ok(gateway)
    }

    /// Route quote requests through the certification service.
    pub fn with_certification_service(mut self, certifier: Arc<dyn CertificationService>) -> Self {
        self.certifier = Some(certifier);
        self
    }

    pub async fn application_key_public(&self) -> Result<String> {
        self.with_retry("application_key_public", || self.tpm.application_key_public())
            .await
    }

    /// Sign with bounded retry on `HardwareUnavailable`.
    pub async fn sign(&self, request: &SignRequest) -> Result<Vec<u8>> {
        let digest = request.prepared_digest()?;
        self.with_retry("sign", || {
            self.tpm
                .sign_digest(digest.clone(), request.hash_alg, request.scheme)
        })
        .await
    }

    /// Sign with a single TPM round-trip.
    pub async fn sign_once(&self, request: &SignRequest) -> Result<Vec<u8>> {
        let digest = request.prepared_digest()?;
        self.tpm
            .sign_digest(digest, request.hash_alg, request.scheme)
            .await
    }

    pub async fn generate_quote(&self, nonce: &str) -> Result<TpmQuote> {
        let certifier = self.certifier.as_ref().ok_or_else(|| {
            Error::Unsupported("gateway has no route to an attestation key".to_string())
        })?;
        Ok(certifier.get_quote(nonce).await?.quote)
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Err(Error::HardwareUnavailable(reason)) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(op, attempt, %reason, "HardwareKeyGateway :: TPM unavailable :: retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                other => return other,
            }
        }
    }
}
