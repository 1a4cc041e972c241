//! HTTP client for a remote Delegated Certification Service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use sovereign_core::{
    CertificationService, CertifyResponse, Error, GeolocationClaim, QuoteResponse, Rejection,
    Result,
};

use crate::http::{
    CertifyAppKeyRequest, NonceRequest, CERTIFY_PATH, GEOLOCATION_PATH, NO_SENSOR_CODE, QUOTE_PATH,
};

/// PEM client identity (certificate chain followed by private key).
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub pem: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpCertificationClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpCertificationClient {
    /// Plain client, for the agent-side gateway on the same host.
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

    /// Mutually authenticated client that trusts only `server_cert_pem`.
    pub fn with_mtls(
        base_url: impl Into<String>,
        server_cert_pem: &str,
        identity: Option<&ClientIdentity>,
        timeout: Duration,
    ) -> Result<Self> {
        let server_cert = reqwest::Certificate::from_pem(server_cert_pem.as_bytes())
            .map_err(|e| Error::Config(format!("transport certificate: {}", e)))?;
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(server_cert)
            .timeout(timeout);
        if let Some(identity) = identity {
            let identity = reqwest::Identity::from_pem(&identity.pem)
                .map_err(|e| Error::Config(format!("client identity: {}", e)))?;
            builder = builder.identity(identity);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn send<Req>(&self, path: &str, body: &Req) -> Result<reqwest::Response>
    where
        Req: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "CertificationClient :: POST");
        self.http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self.send(path, body).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::Transport(format!("{} not found on peer", path)));
        }
        if !status.is_success() {
            return Err(decode_rejection(status, response).await);
        }
        decode_body(response).await
    }
}

async fn decode_body<Resp: DeserializeOwned>(response: reqwest::Response) -> Result<Resp> {
    response
        .json::<Resp>()
        .await
        .map_err(|e| Error::Transport(format!("malformed response: {}", e)))
}

pub fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::VerifierTimeout(e.to_string())
    } else {
        Error::Transport(e.to_string())
    }
}

/// Rebuild a peer error from its rejection body, or from the status alone.
pub async fn decode_rejection(status: StatusCode, response: reqwest::Response) -> Error {
    match response.json::<Rejection>().await {
        Ok(rejection) => rejection.into_error(),
        Err(_) if status.is_server_error() => Error::Transport(format!("peer returned {}", status)),
        Err(_) => Error::Rejected(Rejection {
            code: "HttpStatus".to_string(),
            retryable: false,
            message: format!("peer returned {}", status),
            failure: None,
            retry_after_secs: None,
        }),
    }
}

#[async_trait]
impl CertificationService for HttpCertificationClient {
    async fn certify_application_key(
        &self,
        app_key_public: &str,
        nonce: &str,
    ) -> Result<CertifyResponse> {
        let request = CertifyAppKeyRequest {
            app_key_public: app_key_public.to_string(),
            nonce: nonce.to_string(),
        };
        self.post(CERTIFY_PATH, &request).await
    }

    async fn get_quote(&self, nonce: &str) -> Result<QuoteResponse> {
        let request = NonceRequest {
            nonce: nonce.to_string(),
        };
        self.post(QUOTE_PATH, &request).await
    }

    async fn get_attested_geolocation(&self, nonce: &str) -> Result<Option<GeolocationClaim>> {
        let request = NonceRequest {
            nonce: nonce.to_string(),
        };
        let response = self.send(GEOLOCATION_PATH, &request).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // Only the service's own verdict means "no sensor"; a bare 404 is a
            // misrouted request.
            return match response.json::<Rejection>().await {
                Ok(rejection) if rejection.code == NO_SENSOR_CODE => Ok(None),
                _ => Err(Error::Transport(format!(
                    "{} not found on peer",
                    GEOLOCATION_PATH
                ))),
            };
        }
        if !status.is_success() {
            return Err(decode_rejection(status, response).await);
        }
        decode_body(response).await.map(Some)
    }
}
