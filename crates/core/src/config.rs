//! Configuration management for the sovereign attestation stack.
//!
//! One file configures every role; each binary reads the sections it needs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{SensorType, GEOLOCATION_PCR_INDEX};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub gateway: GatewayConfig,
    pub certification: CertificationConfig,
    pub sensor: SensorConfig,
    pub verifier: VerifierConfig,
    pub agent: AgentConfig,
    pub composer: ComposerConfig,
    pub server: ServerConfig,
    pub capabilities: CapabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Per-operation TPM deadline; must be tighter than any network deadline
    pub tpm_timeout_ms: u64,
    pub queue_depth: usize,
    pub max_hardware_retries: u32,
    pub retry_backoff_ms: u64,
    pub ipc_socket: PathBuf,
    /// Persisted EK/AK; unset means both are regenerated at every start
    pub key_store: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tpm_timeout_ms: 2_000,
            queue_depth: 32,
            max_hardware_retries: 3,
            retry_backoff_ms: 50,
            ipc_socket: PathBuf::from("/run/sovereign/gateway.sock"),
            key_store: None,
        }
    }
}

impl GatewayConfig {
    pub fn tpm_timeout(&self) -> Duration {
        Duration::from_millis(self.tpm_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificationConfig {
    pub unified_identity_enabled: bool,
    pub bind_addr: String,
    /// Empty means every caller is allowed
    pub allowed_callers: Vec<String>,
    /// Requests per window per caller; 0 disables the limit
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub geolocation_pcr: u8,
    /// How long a nonce-bound geolocation claim stays fetchable
    pub geolocation_ttl_secs: u64,
    pub agent_id: String,
}

impl Default for CertificationConfig {
    fn default() -> Self {
        Self {
            unified_identity_enabled: true,
            bind_addr: "127.0.0.1:9002".to_string(),
            allowed_callers: Vec::new(),
            rate_limit: 10,
            rate_window_secs: 60,
            geolocation_pcr: GEOLOCATION_PCR_INDEX,
            geolocation_ttl_secs: 300,
            agent_id: "agent-001".to_string(),
        }
    }
}

impl CertificationConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn geolocation_ttl(&self) -> Duration {
        Duration::from_secs(self.geolocation_ttl_secs)
    }
}

/// Location sensor attached to the host, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub sensor_type: Option<SensorType>,
    pub sensor_id: Option<String>,
    pub imei: Option<String>,
    pub imsi: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimsPolicyConfig {
    /// Empty means any sensor type
    pub allowed_sensor_types: Vec<SensorType>,
    /// Empty means any sensor id
    pub allowed_sensor_ids: Vec<String>,
    pub require_geolocation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub registry_url: String,
    /// Deadline for each round-trip to registry or certification service
    pub request_timeout_ms: u64,
    pub nonce_ttl_secs: u64,
    pub max_outstanding_nonces: usize,
    /// Client identity presented to certification services (PEM)
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub policy: ClaimsPolicyConfig,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            registry_url: "http://127.0.0.1:8891".to_string(),
            request_timeout_ms: 5_000,
            nonce_ttl_secs: 300,
            max_outstanding_nonces: 10_000,
            client_cert: None,
            client_key: None,
            policy: ClaimsPolicyConfig::default(),
        }
    }
}

impl VerifierConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_id: String,
    pub server_url: String,
    pub certification_url: String,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub cycle_deadline_ms: u64,
    pub rate_limit_retries: u32,
    pub max_rate_limit_wait_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent-001".to_string(),
            server_url: "http://127.0.0.1:8081".to_string(),
            certification_url: "http://127.0.0.1:9002".to_string(),
            max_attempts: 3,
            backoff_ms: 250,
            cycle_deadline_ms: 30_000,
            rate_limit_retries: 1,
            max_rate_limit_wait_ms: 60_000,
        }
    }
}

impl AgentConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_millis(self.cycle_deadline_ms)
    }

    pub fn max_rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.max_rate_limit_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    pub trust_domain: String,
    pub agent_validity_secs: u64,
    pub workload_validity_secs: u64,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            trust_domain: "example.org".to_string(),
            agent_validity_secs: 3_600,
            workload_validity_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8081".to_string(),
        }
    }
}

/// Closed set of pluggable roles, chosen at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Verifies hardware evidence during node attestation
    NodeAttestor,
    /// Embeds attested claims into issued credentials
    CredentialComposer,
    /// Collects geolocation evidence alongside quotes
    EvidenceCollector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub enabled: Vec<Capability>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            enabled: vec![
                Capability::NodeAttestor,
                Capability::CredentialComposer,
                Capability::EvidenceCollector,
            ],
        }
    }
}

impl CapabilityConfig {
    pub fn is_enabled(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }
}

impl Config {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise.
    #[cfg(feature = "toml")]
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default_config()),
        }
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.tpm_timeout_ms == 0 || self.verifier.request_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        if self.gateway.tpm_timeout_ms >= self.verifier.request_timeout_ms {
            return Err(Error::Config(
                "gateway.tpm_timeout_ms must be tighter than verifier.request_timeout_ms".to_string(),
            ));
        }
        if self.verifier.request_timeout_ms >= self.agent.cycle_deadline_ms {
            return Err(Error::Config(
                "verifier.request_timeout_ms must be below agent.cycle_deadline_ms".to_string(),
            ));
        }
        if self.certification.geolocation_pcr != GEOLOCATION_PCR_INDEX {
            return Err(Error::Config(format!(
                "geolocation must use PCR {}",
                GEOLOCATION_PCR_INDEX
            )));
        }
        if self.verifier.nonce_ttl_secs == 0 {
            return Err(Error::Config("verifier.nonce_ttl_secs must be non-zero".to_string()));
        }
        if self.agent.max_attempts == 0 {
            return Err(Error::Config("agent.max_attempts must be at least 1".to_string()));
        }
        if self.certification.rate_limit > 0 && self.certification.rate_window_secs == 0 {
            return Err(Error::Config("rate_window_secs must be non-zero".to_string()));
        }
        if self.sensor.sensor_type.is_some() && self.sensor.sensor_id.is_none() {
            return Err(Error::Config("sensor.sensor_id is required with sensor_type".to_string()));
        }
        Ok(())
    }
}
