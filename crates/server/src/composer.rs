//! Credential Composer.
//!
//! Agent credentials carry the verifier's `AttestedClaims` verbatim under
//! [`ATTESTED_CLAIMS_OID`]. Workload credentials are issued from the agent
//! credential alone: no hardware evidence is re-checked and none is copied,
//! trust flows through the chain.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tracing::{info, warn};

use sovereign_core::config::ComposerConfig;
use sovereign_core::crypto::parse_public_key_pem;
use sovereign_core::{
    current_timestamp, AgentCredential, AttestedClaims, Credential, CredentialChain, Error,
    Extension, KeySource, Result, WorkloadClaims, WorkloadCredential, ATTESTED_CLAIMS_OID,
    WORKLOAD_CLAIMS_OID,
};

use crate::authority::IssuingAuthority;

pub struct CredentialComposer {
    authority: Arc<dyn IssuingAuthority>,
    trust_domain: String,
    agent_validity: Duration,
    workload_validity: Duration,
}

impl CredentialComposer {
    pub fn new(authority: Arc<dyn IssuingAuthority>, config: &ComposerConfig) -> Self {
        Self {
            authority,
            trust_domain: config.trust_domain.clone(),
            agent_validity: Duration::from_secs(config.agent_validity_secs),
            workload_validity: Duration::from_secs(config.workload_validity_secs),
        }
    }

    pub fn root(&self) -> &Credential {
        self.authority.root()
    }

    pub fn agent_subject(&self, agent_id: &str) -> String {
        format!("spiffe://{}/agent/{}", self.trust_domain, agent_id)
    }

    pub fn workload_subject(&self, workload_id: &str) -> String {
        format!("spiffe://{}/workload/{}", self.trust_domain, workload_id)
    }

    /// Issue the intermediate credential for a verified agent.
    ///
    /// Refuses claims that are not fully verified; no partial credential is
    /// ever issued.
    pub fn compose_agent_credential(
        &self,
        agent_id: &str,
        claims: &AttestedClaims,
        app_key_public: &str,
    ) -> Result<AgentCredential> {
        validate_id(agent_id)?;
        if !claims.is_fully_verified() {
            warn!(agent_id, "CredentialComposer :: Unverified claims REFUSED");
            return Err(Error::InvalidState(
                "attested claims are not fully verified".to_string(),
            ));
        }
        let root = self.authority.root();
        let now = current_timestamp();
        let not_after = now
            .saturating_add(self.agent_validity.as_millis() as u64)
            .min(root.not_after);

        let extensions = vec![
            Extension {
                oid: ATTESTED_CLAIMS_OID.to_string(),
                critical: false,
                value: claims.to_bytes()?,
            },
            workload_claims_extension(agent_id, KeySource::TpmAppKey)?,
        ];
        let credential = self.issue(Credential {
            serial: String::new(),
            subject: self.agent_subject(agent_id),
            issuer: root.subject.clone(),
            public_key: app_key_public.to_string(),
            parent: Some(root.fingerprint()?),
            not_before: now,
            not_after,
            extensions,
            signature: Vec::new(),
        })?;
        info!(
            subject = %credential.subject,
            geolocation = claims.geolocation.is_some(),
            "CredentialComposer :: Agent Credential ISSUED"
        );
        Ok(AgentCredential::new(credential))
    }

    /// Issue a workload credential beneath `agent` and return the full chain.
    pub fn compose_workload_credential(
        &self,
        workload_id: &str,
        workload_public_key: &str,
        agent: &AgentCredential,
    ) -> Result<CredentialChain> {
        validate_id(workload_id)?;
        parse_public_key_pem(workload_public_key)
            .map_err(|e| Error::InvalidRequest(format!("workload key: {}", e)))?;

        let root = self.authority.root().clone();
        let now = current_timestamp();
        self.check_issued_agent(agent, &root, now)?;

        let issuer = agent.credential();
        let not_after = now
            .saturating_add(self.workload_validity.as_millis() as u64)
            .min(issuer.not_after);
        let credential = self.issue(Credential {
            serial: String::new(),
            subject: self.workload_subject(workload_id),
            issuer: issuer.subject.clone(),
            public_key: workload_public_key.to_string(),
            parent: Some(issuer.fingerprint()?),
            not_before: now,
            not_after,
            extensions: vec![workload_claims_extension(workload_id, KeySource::WorkloadKey)?],
            signature: Vec::new(),
        })?;

        let chain = CredentialChain {
            workload: WorkloadCredential::new(credential)?,
            agent: agent.clone(),
            root,
        };
        chain.validate(now)?;
        info!(
            subject = %chain.workload.credential().subject,
            agent = %issuer.subject,
            "CredentialComposer :: Workload Credential ISSUED"
        );
        Ok(chain)
    }

    /// The agent credential must be ours, current, and carry attested claims.
    fn check_issued_agent(&self, agent: &AgentCredential, root: &Credential, now: u64) -> Result<()> {
        let credential = agent.credential();
        let refused = |reason: &str| {
            warn!(subject = %credential.subject, reason, "CredentialComposer :: Agent credential REFUSED");
            Error::InvalidRequest(format!("agent credential: {}", reason))
        };
        if credential.issuer != root.subject {
            return Err(refused("not issued by this authority"));
        }
        credential
            .verify_signature(&root.public_key)
            .map_err(|_| refused("signature does not verify"))?;
        if !credential.is_valid_at(now) {
            return Err(refused("outside validity window"));
        }
        match agent.attested_claims() {
            Ok(Some(claims)) if claims.is_fully_verified() => Ok(()),
            _ => Err(refused("no attested claims")),
        }
    }

    fn issue(&self, mut credential: Credential) -> Result<Credential> {
        credential.serial = new_serial(&credential.subject);
        credential.signature = self.authority.sign(&credential.tbs_bytes()?)?;
        Ok(credential)
    }
}

fn workload_claims_extension(workload_id: &str, key_source: KeySource) -> Result<Extension> {
    let claims = WorkloadClaims {
        workload_id: workload_id.to_string(),
        key_source,
    };
    Ok(Extension {
        oid: WORKLOAD_CLAIMS_OID.to_string(),
        critical: false,
        value: serde_json::to_vec(&claims)?,
    })
}

fn new_serial(subject: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut hasher = blake3::Hasher::new();
    hasher.update(subject.as_bytes());
    hasher.update(&current_timestamp().to_be_bytes());
    hasher.update(&salt);
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// Agent and workload ids become SPIFFE path segments.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("invalid identifier '{}'", id)))
    }
}
