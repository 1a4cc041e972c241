//! Transport Signer Bridge.
//!
//! After an agent credential is issued, every mutual-authentication
//! handshake is signed by the TPM-resident application key through the
//! gateway. There is no exportable private key to fall back to.

use std::sync::Arc;

use tracing::{info, warn};

use sovereign_core::{
    current_timestamp, AgentCredential, Error, HashAlgorithm, Result, SignatureScheme,
};

use crate::gateway::{HardwareKeyGateway, SignRequest};

pub struct TransportSigner {
    gateway: Arc<HardwareKeyGateway>,
    credential: AgentCredential,
}

impl std::fmt::Debug for TransportSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSigner")
            .field("subject", &self.credential.credential().subject)
            .finish()
    }
}

impl TransportSigner {
    /// Bind an issued credential to the gateway's current application key.
    pub async fn bind(gateway: Arc<HardwareKeyGateway>, credential: AgentCredential) -> Result<Self> {
        let resident = gateway.application_key_public().await?;
        if resident.trim() != credential.credential().public_key.trim() {
            return Err(Error::InvalidState(
                "credential was issued for a different application key".to_string(),
            ));
        }
        info!(
            subject = %credential.credential().subject,
            "STATUS: TransportSigner :: TPM-bound transport identity :: ACTIVE"
        );
        Ok(Self {
            gateway,
            credential,
        })
    }

    pub fn credential(&self) -> &AgentCredential {
        &self.credential
    }

    /// PEM public key matching the transport certificate.
    pub fn public_key_pem(&self) -> &str {
        &self.credential.credential().public_key
    }

    /// Sign a handshake transcript digest.
    ///
    /// One gateway round-trip per handshake; `HardwareUnavailable` aborts
    /// this handshake only.
    pub async fn sign(&self, handshake_digest: &[u8], scheme: SignatureScheme) -> Result<Vec<u8>> {
        if !self.credential.credential().is_valid_at(current_timestamp()) {
            return Err(Error::InvalidState(
                "agent credential expired; a new attestation cycle is required".to_string(),
            ));
        }
        let hash_alg = HashAlgorithm::from_digest_len(handshake_digest.len())?;
        let request = SignRequest::digest(handshake_digest.to_vec(), hash_alg, scheme);
        self.gateway.sign_once(&request).await.map_err(|e| {
            if let Error::HardwareUnavailable(reason) = &e {
                warn!(%reason, "TransportSigner :: Handshake ABORTED :: TPM unavailable");
            }
            e
        })
    }
}
