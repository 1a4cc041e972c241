//! Registry Lookup Client.
//!
//! Read path only. Records are never cached past a single verification so
//! rotated AK material is picked up on the next cycle.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tracing::{debug, warn};

use sovereign_core::{Error, RegistryLookup, RegistryRecord, Result, VerificationFailure};

#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpRegistryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("registry url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("registry url {} cannot be a base", base_url)));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;
        Ok(Self { base_url, http })
    }

    fn agent_url(&self, agent_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config("registry url cannot be a base".to_string()))?
            .pop_if_empty()
            .push("agents")
            .push(agent_id);
        Ok(url)
    }
}

#[async_trait]
impl RegistryLookup for HttpRegistryClient {
    async fn lookup(&self, agent_id: &str) -> Result<RegistryRecord> {
        if agent_id.is_empty() {
            return Err(VerificationFailure::AgentNotFound.into());
        }
        let url = self.agent_url(agent_id)?;
        debug!(%url, "RegistryClient :: GET");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::RegistryUnavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(VerificationFailure::AgentNotFound.into()),
            status if status.is_success() => {
                let mut record: RegistryRecord = response
                    .json()
                    .await
                    .map_err(|e| Error::RegistryUnavailable(format!("malformed record: {}", e)))?;
                if record.agent_id.is_empty() {
                    record.agent_id = agent_id.to_string();
                }
                if record.agent_id != agent_id {
                    warn!(agent_id, returned = %record.agent_id, "RegistryClient :: Record for wrong agent");
                    return Err(Error::RegistryUnavailable(
                        "registry returned a record for another agent".to_string(),
                    ));
                }
                Ok(record)
            }
            status => Err(Error::RegistryUnavailable(format!("registry returned {}", status))),
        }
    }
}

/// In-memory registry for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    records: RwLock<HashMap<String, RegistryRecord>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: RegistryRecord) -> Result<()> {
        self.records
            .write()
            .map_err(|e| Error::InvalidState(format!("registry lock poisoned: {}", e)))?
            .insert(record.agent_id.clone(), record);
        Ok(())
    }

    pub fn remove(&self, agent_id: &str) -> Result<Option<RegistryRecord>> {
        Ok(self
            .records
            .write()
            .map_err(|e| Error::InvalidState(format!("registry lock poisoned: {}", e)))?
            .remove(agent_id))
    }
}

#[async_trait]
impl RegistryLookup for StaticRegistry {
    async fn lookup(&self, agent_id: &str) -> Result<RegistryRecord> {
        self.records
            .read()
            .map_err(|e| Error::RegistryUnavailable(format!("registry lock poisoned: {}", e)))?
            .get(agent_id)
            .cloned()
            .ok_or(Error::VerificationFailed(VerificationFailure::AgentNotFound))
    }
}
