//! Opens a channel to an agent's certification service from its registry record.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use sovereign_core::config::VerifierConfig;
use sovereign_core::{CertificationService, Error, RegistryRecord, Result};
use sovereign_tpm::{ClientIdentity, HttpCertificationClient};

pub trait CertificationConnector: Send + Sync {
    fn connect(&self, record: &RegistryRecord) -> Result<Arc<dyn CertificationService>>;
}

/// HTTPS with mutual auth, pinned to the record's transport certificate.
#[derive(Debug, Clone)]
pub struct MtlsConnector {
    identity: Option<ClientIdentity>,
    timeout: Duration,
}

impl MtlsConnector {
    pub fn new(identity: Option<ClientIdentity>, timeout: Duration) -> Self {
        Self { identity, timeout }
    }

    /// Reads `client_cert` and `client_key` when both are configured.
    pub fn from_config(config: &VerifierConfig) -> Result<Self> {
        let identity = match (&config.client_cert, &config.client_key) {
            (Some(cert), Some(key)) => {
                let mut pem = std::fs::read(cert)?;
                pem.push(b'\n');
                pem.extend(std::fs::read(key)?);
                Some(ClientIdentity { pem })
            }
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "verifier.client_cert and verifier.client_key must be set together".to_string(),
                ))
            }
        };
        Ok(Self::new(identity, config.request_timeout()))
    }
}

impl CertificationConnector for MtlsConnector {
    fn connect(&self, record: &RegistryRecord) -> Result<Arc<dyn CertificationService>> {
        let base_url = format!("https://{}", record.network_address());
        debug!(agent_id = %record.agent_id, %base_url, "MtlsConnector :: Connecting");
        let client = HttpCertificationClient::with_mtls(
            base_url,
            &record.transport_cert,
            self.identity.as_ref(),
            self.timeout,
        )
        .map_err(|e| Error::Transport(format!("agent {}: {}", record.agent_id, e)))?;
        Ok(Arc::new(client))
    }
}

/// Resolves agents to services living in the same process.
#[derive(Default)]
pub struct InProcessConnector {
    services: RwLock<HashMap<String, Arc<dyn CertificationService>>>,
}

impl InProcessConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: impl Into<String>, service: Arc<dyn CertificationService>) -> Result<()> {
        self.services
            .write()
            .map_err(|e| Error::InvalidState(format!("connector lock poisoned: {}", e)))?
            .insert(agent_id.into(), service);
        Ok(())
    }
}

impl CertificationConnector for InProcessConnector {
    fn connect(&self, record: &RegistryRecord) -> Result<Arc<dyn CertificationService>> {
        self.services
            .read()
            .map_err(|e| Error::InvalidState(format!("connector lock poisoned: {}", e)))?
            .get(&record.agent_id)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no route to agent {}", record.agent_id)))
    }
}
