//! On-Demand Verification Engine.
//!
//! A linear pipeline, fail-fast on the first violation:
//!
//! 1. resolve the agent through the registry
//! 2. verify the AK signature over `certify_data` with the registry AK
//! 3. check the certified qualifying data and name against the app key and nonce
//! 4. fetch a fresh quote over the agent's transport and verify it under the AK
//! 5. check the quote nonce
//! 6. fetch the geolocation claim and check it against PCR 15 of the quote
//! 7. consume the nonce
//! 8. return the attested claims
//!
//! The nonce is consumed last, so a cycle that fails on a timeout or a
//! transport error leaves it usable until it expires. Nothing here retries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};

use sovereign_core::attest::CertifyInfo;
use sovereign_core::crypto::{
    constant_time_eq, expected_geolocation_pcr, object_name, parse_public_key_pem,
    qualifying_data, verify_ecdsa,
};
use sovereign_core::{
    AttestationMessage, AttestedClaims, ChallengeNonce, Error, GeolocationClaim, RegistryLookup,
    Result, TpmQuote, VerificationFailure, GEOLOCATION_PCR_INDEX,
};

use crate::connector::CertificationConnector;
use crate::nonce::NonceStore;
use crate::policy::ClaimsPolicy;

pub struct VerificationEngine {
    registry: Arc<dyn RegistryLookup>,
    connector: Arc<dyn CertificationConnector>,
    nonces: Arc<NonceStore>,
    policy: ClaimsPolicy,
    timeout: Duration,
}

impl VerificationEngine {
    pub fn new(
        registry: Arc<dyn RegistryLookup>,
        connector: Arc<dyn CertificationConnector>,
        nonces: Arc<NonceStore>,
        timeout: Duration,
    ) -> Self {
        info!(timeout_ms = timeout.as_millis() as u64, "STATUS: VerificationEngine :: On-demand verification :: ACTIVE");
        Self {
            registry,
            connector,
            nonces,
            policy: ClaimsPolicy::permissive(),
            timeout,
        }
    }

    pub fn with_policy(mut self, policy: ClaimsPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn nonces(&self) -> &Arc<NonceStore> {
        &self.nonces
    }

    pub fn issue_nonce(&self, agent_id: &str) -> Result<ChallengeNonce> {
        self.nonces.issue(agent_id)
    }

    pub async fn verify(&self, message: &AttestationMessage) -> Result<AttestedClaims> {
        let session = message.session();
        let span = info_span!("verify", session = %session);
        async {
            let result = self.run(message).await;
            match &result {
                Ok(claims) => info!(
                    geolocation = claims.geolocation.is_some(),
                    "VerificationEngine :: Attestation VERIFIED"
                ),
                Err(e) => warn!(code = e.code(), error = %e, "VerificationEngine :: Attestation REJECTED"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, message: &AttestationMessage) -> Result<AttestedClaims> {
        let session = message.session();
        let nonce = message.challenge_nonce.as_str();

        // Fail fast on spent or foreign nonces before any network round-trip.
        self.nonces.check(&session)?;

        let record = self.registry.lookup(&message.agent_id).await?;
        let ak = parse_public_key_pem(&record.ak_public).map_err(|e| {
            warn!(error = %e, "VerificationEngine :: Registry AK unparseable");
            Error::VerificationFailed(VerificationFailure::CertSignatureInvalid)
        })?;

        let certificate = &message.app_key_certificate;
        if !verify_ecdsa(&ak, &certificate.certify_data, &certificate.signature) {
            return Err(VerificationFailure::CertSignatureInvalid.into());
        }

        let certified = CertifyInfo::unmarshal(&certificate.certify_data)
            .map_err(|_| Error::VerificationFailed(VerificationFailure::QualifyingDataMismatch))?;
        let expected = qualifying_data(&message.app_key_public, nonce);
        if !constant_time_eq(&certified.extra_data, &expected)
            || !constant_time_eq(&certified.certified_name, &object_name(&message.app_key_public))
        {
            return Err(VerificationFailure::QualifyingDataMismatch.into());
        }
        debug!("VerificationEngine :: AppKey certification checked");

        if !message.quote.is_empty() {
            debug!("VerificationEngine :: Ignoring agent-supplied quote");
        }
        let service = self.connector.connect(&record)?;
        let response = self.bounded("quote", service.get_quote(nonce)).await?;
        let quote = response.quote;
        let signed = quote
            .message()
            .map_err(|_| Error::VerificationFailed(VerificationFailure::QuoteSignatureInvalid))?;
        if !verify_ecdsa(&ak, &signed, &quote.signature) {
            return Err(VerificationFailure::QuoteSignatureInvalid.into());
        }
        if !constant_time_eq(quote.nonce.as_bytes(), nonce.as_bytes()) {
            return Err(VerificationFailure::NonceMismatch.into());
        }
        debug!("VerificationEngine :: Quote Verified");

        // Only a clean "no sensor" is tolerated; any other failure rejects the cycle.
        let geolocation = self
            .bounded("geolocation", service.get_attested_geolocation(nonce))
            .await?;
        if response.geolocation.is_some() && response.geolocation != geolocation {
            return Err(VerificationFailure::GeolocationVerificationFailed.into());
        }
        if let Some(claim) = &geolocation {
            verify_geolocation(&quote, claim, nonce)?;
        }

        self.policy.evaluate(geolocation.as_ref())?;
        self.nonces.consume(&session)?;
        Ok(AttestedClaims::verified(geolocation))
    }

    async fn bounded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::VerifierTimeout(format!(
                "{} fetch exceeded {:?}",
                what, self.timeout
            ))),
        }
    }
}

fn verify_geolocation(quote: &TpmQuote, claim: &GeolocationClaim, nonce: &str) -> Result<()> {
    let failed = || Error::VerificationFailed(VerificationFailure::GeolocationVerificationFailed);
    if claim.nonce != nonce || claim.pcr_index != GEOLOCATION_PCR_INDEX {
        return Err(failed());
    }
    let expected = expected_geolocation_pcr(claim, nonce).map_err(|_| failed())?;
    let pcr = quote.pcr(GEOLOCATION_PCR_INDEX).ok_or_else(failed)?;
    if !constant_time_eq(&pcr.value, &expected) {
        return Err(failed());
    }
    Ok(())
}
