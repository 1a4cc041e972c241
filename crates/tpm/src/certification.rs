//! Delegated Certification Service.
//!
//! Holds the attestation key. Certifies application keys against a
//! caller-supplied nonce, produces quotes, and binds geolocation evidence
//! to PCR 15 before quoting. Every entry point is allow-listed and rate
//! limited per caller so certification cannot become a signing oracle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use sovereign_core::config::CertificationConfig;
use sovereign_core::crypto::{geolocation_measurement, parse_public_key_pem, qualifying_data};
use sovereign_core::{
    AttestationKeyResponse, CertificationService, CertifyResponse, Error, GeolocationClaim,
    QuoteResponse, Result,
};

use crate::actor::TpmHandle;
use crate::backend::DEFAULT_QUOTE_SELECTION;
use crate::ratelimit::RateLimiter;
use crate::sensor::LocationSensor;

struct BoundClaim {
    claim: GeolocationClaim,
    bound_at: Instant,
}

pub struct DelegatedCertificationService {
    tpm: TpmHandle,
    agent_id: String,
    enabled: bool,
    allowed_callers: HashSet<String>,
    limiter: RateLimiter,
    sensor: Option<Arc<dyn LocationSensor>>,
    geolocation_pcr: u8,
    geolocation_ttl: Duration,
    bound_claims: RwLock<HashMap<String, BoundClaim>>,
}

impl DelegatedCertificationService {
    pub fn new(tpm: TpmHandle, config: &CertificationConfig) -> Self {
        if config.allowed_callers.is_empty() {
            warn!("DelegatedCertification :: Allow-list empty :: all callers accepted");
        }
        Self {
            tpm,
            agent_id: config.agent_id.clone(),
            enabled: config.unified_identity_enabled,
            allowed_callers: config.allowed_callers.iter().cloned().collect(),
            limiter: RateLimiter::new(config.rate_limit, config.rate_window()),
            sensor: None,
            geolocation_pcr: config.geolocation_pcr,
            geolocation_ttl: config.geolocation_ttl(),
            bound_claims: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a location sensor (the evidence-collector capability).
    pub fn with_sensor(mut self, sensor: Arc<dyn LocationSensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Public EK/AK material for registry enrollment. Not allow-listed: it
    /// carries nothing a caller could use to obtain a signature.
    pub async fn attestation_key(&self) -> Result<AttestationKeyResponse> {
        Ok(AttestationKeyResponse {
            agent_id: self.agent_id.clone(),
            ak_public: self.tpm.attestation_key_public().await?,
            ek_public: self.tpm.endorsement_key_public().await?,
            ak_certificate: self.tpm.attestation_key_certificate().await?,
        })
    }

    fn authorize(&self, caller: &str) -> Result<()> {
        if !self.enabled {
            return Err(Error::Unsupported("unified identity is disabled".to_string()));
        }
        if !self.allowed_callers.is_empty() && !self.allowed_callers.contains(caller) {
            warn!(caller, "DelegatedCertification :: Caller REJECTED :: not allow-listed");
            return Err(Error::CallerNotAllowed(caller.to_string()));
        }
        self.limiter.check(caller).map_err(|e| {
            warn!(caller, "DelegatedCertification :: Caller THROTTLED");
            e
        })
    }

    fn validate_nonce(nonce: &str) -> Result<()> {
        if nonce.is_empty() {
            return Err(Error::InvalidRequest("challenge nonce is empty".to_string()));
        }
        Ok(())
    }

    pub async fn certify_application_key(
        &self,
        caller: &str,
        app_key_public: &str,
        nonce: &str,
    ) -> Result<CertifyResponse> {
        self.authorize(caller)?;
        Self::validate_nonce(nonce)?;
        parse_public_key_pem(app_key_public)
            .map_err(|e| Error::InvalidRequest(format!("app key: {}", e)))?;

        let qualifying = qualifying_data(app_key_public, nonce);
        let certificate = self
            .tpm
            .certify(app_key_public.to_string(), qualifying.to_vec())
            .await?;
        info!(caller, "DelegatedCertification :: AppKey Certified");
        Ok(CertifyResponse {
            certificate,
            agent_id: self.agent_id.clone(),
        })
    }

    pub async fn get_quote(&self, caller: &str, nonce: &str) -> Result<QuoteResponse> {
        self.authorize(caller)?;
        Self::validate_nonce(nonce)?;

        let claim = self.read_claim(nonce)?;
        let quote = match &claim {
            Some(claim) => {
                let measurement = geolocation_measurement(claim, nonce)?;
                self.tpm
                    .extend_and_quote(
                        self.geolocation_pcr,
                        measurement,
                        nonce.to_string(),
                        DEFAULT_QUOTE_SELECTION.to_vec(),
                    )
                    .await?
            }
            None => {
                self.tpm
                    .quote(nonce.to_string(), DEFAULT_QUOTE_SELECTION.to_vec())
                    .await?
            }
        };
        if let Some(claim) = &claim {
            self.remember(nonce, claim.clone())?;
        }
        info!(caller, geolocation = claim.is_some(), "DelegatedCertification :: Quote Generated");
        Ok(QuoteResponse {
            quote,
            geolocation: claim,
        })
    }

    /// Claim bound to `nonce`. Reuses the claim from the quote for the same
    /// nonce; otherwise binds a new one, which a quote taken earlier will not
    /// reflect.
    pub async fn get_attested_geolocation(
        &self,
        caller: &str,
        nonce: &str,
    ) -> Result<Option<GeolocationClaim>> {
        self.authorize(caller)?;
        Self::validate_nonce(nonce)?;

        if let Some(claim) = self.recall(nonce)? {
            return Ok(Some(claim));
        }
        let Some(claim) = self.read_claim(nonce)? else {
            return Ok(None);
        };
        let measurement = geolocation_measurement(&claim, nonce)?;
        self.tpm
            .reset_and_extend(self.geolocation_pcr, measurement)
            .await?;
        self.remember(nonce, claim.clone())?;
        info!(caller, sensor = %claim.sensor_type, "DelegatedCertification :: Geolocation Bound");
        Ok(Some(claim))
    }

    fn read_claim(&self, nonce: &str) -> Result<Option<GeolocationClaim>> {
        let Some(sensor) = &self.sensor else {
            return Ok(None);
        };
        Ok(sensor
            .read()?
            .map(|reading| reading.into_claim(nonce, self.geolocation_pcr)))
    }

    fn remember(&self, nonce: &str, claim: GeolocationClaim) -> Result<()> {
        let mut claims = self
            .bound_claims
            .write()
            .map_err(|e| Error::InvalidState(format!("claim cache lock poisoned: {}", e)))?;
        let ttl = self.geolocation_ttl;
        claims.retain(|_, bound| bound.bound_at.elapsed() < ttl);
        claims.insert(
            nonce.to_string(),
            BoundClaim {
                claim,
                bound_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn recall(&self, nonce: &str) -> Result<Option<GeolocationClaim>> {
        let claims = self
            .bound_claims
            .read()
            .map_err(|e| Error::InvalidState(format!("claim cache lock poisoned: {}", e)))?;
        Ok(claims
            .get(nonce)
            .filter(|bound| bound.bound_at.elapsed() < self.geolocation_ttl)
            .map(|bound| bound.claim.clone()))
    }
}

/// In-process client presenting a fixed caller identity.
#[derive(Clone)]
pub struct LocalCertificationClient {
    service: Arc<DelegatedCertificationService>,
    caller: String,
}

impl LocalCertificationClient {
    pub fn new(service: Arc<DelegatedCertificationService>, caller: impl Into<String>) -> Self {
        Self {
            service,
            caller: caller.into(),
        }
    }
}

#[async_trait]
impl CertificationService for LocalCertificationClient {
    async fn certify_application_key(
        &self,
        app_key_public: &str,
        nonce: &str,
    ) -> Result<CertifyResponse> {
        self.service
            .certify_application_key(&self.caller, app_key_public, nonce)
            .await
    }

    async fn get_quote(&self, nonce: &str) -> Result<QuoteResponse> {
        self.service.get_quote(&self.caller, nonce).await
    }

    async fn get_attested_geolocation(&self, nonce: &str) -> Result<Option<GeolocationClaim>> {
        self.service.get_attested_geolocation(&self.caller, nonce).await
    }
}
