//! HTTP client for the identity server.

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use sovereign_core::services::{ATTEST_PATH, NONCE_PATH, WORKLOAD_PATH};
use sovereign_core::{
    AgentCredential, AttestationMessage, AttestationServer, ChallengeNonce, ChallengeRequest,
    CredentialChain, Error, Result, WorkloadRequest,
};
use sovereign_tpm::client::{decode_rejection, map_transport_error};

#[derive(Debug, Clone)]
pub struct HttpAttestationServer {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAttestationServer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "AttestationServerClient :: POST");
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Resp>()
                .await
                .map_err(|e| Error::Transport(format!("malformed response: {}", e)));
        }
        Err(decode_rejection(status, response).await)
    }

    /// Request a workload credential chain on behalf of a local workload.
    pub async fn request_workload_credential(
        &self,
        workload_id: &str,
        public_key: &str,
        agent_credential: &AgentCredential,
    ) -> Result<CredentialChain> {
        let request = WorkloadRequest {
            workload_id: workload_id.to_string(),
            public_key: public_key.to_string(),
            agent_credential: agent_credential.clone(),
        };
        self.post(WORKLOAD_PATH, &request).await
    }
}

#[async_trait]
impl AttestationServer for HttpAttestationServer {
    async fn request_nonce(&self, agent_id: &str) -> Result<ChallengeNonce> {
        let request = ChallengeRequest {
            agent_id: agent_id.to_string(),
        };
        self.post(NONCE_PATH, &request).await
    }

    async fn attest(&self, message: AttestationMessage) -> Result<AgentCredential> {
        self.post(ATTEST_PATH, &message).await
    }
}
