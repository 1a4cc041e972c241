//! Service boundaries between the parties of an attestation cycle.
//!
//! Each trait is one remote party as seen by its caller. Implementations
//! exist in-process (tests, single-node deployments) and over HTTP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credential::AgentCredential;
use crate::error::Result;
use crate::types::{
    b64, AppKeyCertificate, AttestationMessage, ChallengeNonce, GeolocationClaim, RegistryRecord,
    TpmQuote,
};

/// Identity server routes.
pub const NONCE_PATH: &str = "/v1/nonce";
pub const ATTEST_PATH: &str = "/v1/attest";
pub const WORKLOAD_PATH: &str = "/v1/workload";

/// Body of a nonce request to the identity server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub agent_id: String,
}

/// Workload credential request, authorized by the agent's own credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRequest {
    pub workload_id: String,
    /// PEM public key of the workload
    pub public_key: String,
    pub agent_credential: AgentCredential,
}

/// Result of delegated certification: `{certify_data, signature, agent_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifyResponse {
    #[serde(flatten)]
    pub certificate: AppKeyCertificate,
    pub agent_id: String,
}

/// Quote fetch result: `{pcr_values, nonce, signature, geolocation?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteResponse {
    #[serde(flatten)]
    pub quote: TpmQuote,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<GeolocationClaim>,
}

/// Long-lived key material a node publishes for registry enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationKeyResponse {
    pub agent_id: String,
    /// PEM; becomes the registry record's `ak_public`
    pub ak_public: String,
    pub ek_public: String,
    /// EK signature (DER) over `ak_public`
    #[serde(with = "b64")]
    pub ak_certificate: Vec<u8>,
}

/// The higher-privilege service holding the AK.
#[async_trait]
pub trait CertificationService: Send + Sync {
    /// AK-certify the application key for one nonce.
    async fn certify_application_key(
        &self,
        app_key_public: &str,
        nonce: &str,
    ) -> Result<CertifyResponse>;

    /// Fresh quote bound to `nonce`, taken after the geolocation extension.
    async fn get_quote(&self, nonce: &str) -> Result<QuoteResponse>;

    /// Claim bound to `nonce`; `None` when the host has no location sensor.
    async fn get_attested_geolocation(&self, nonce: &str) -> Result<Option<GeolocationClaim>>;
}

/// Read-only registry path used by the verifier.
#[async_trait]
pub trait RegistryLookup: Send + Sync {
    /// Fails with `AgentNotFound` or `RegistryUnavailable`.
    async fn lookup(&self, agent_id: &str) -> Result<RegistryRecord>;
}

/// The identity server as seen by an attesting agent.
#[async_trait]
pub trait AttestationServer: Send + Sync {
    async fn request_nonce(&self, agent_id: &str) -> Result<ChallengeNonce>;

    async fn attest(&self, message: AttestationMessage) -> Result<AgentCredential>;
}
