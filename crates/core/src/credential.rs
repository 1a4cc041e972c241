//! Issued identity credentials and the `[workload, agent, root]` chain.

use ed25519_dalek::{Signature as Ed25519Signature, Verifier, VerifyingKey as Ed25519VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{b64, AttestedClaims};

/// Private enterprise OID carrying `AttestedClaims` inside an agent credential.
pub const ATTESTED_CLAIMS_OID: &str = "1.3.6.1.4.1.99999.1";

/// Private enterprise OID carrying workload-scoped claims.
pub const WORKLOAD_CLAIMS_OID: &str = "1.3.6.1.4.1.99999.2";

/// Claim keys that only a hardware-attested agent credential may carry.
const HARDWARE_CLAIM_KEYS: &[&str] = &["geolocation", "hardware_attestation"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub oid: String,
    pub critical: bool,
    #[serde(with = "b64")]
    pub value: Vec<u8>,
}

/// X.509-style identity document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub serial: String,
    /// Subject identifier (`spiffe://<trust-domain>/...`)
    pub subject: String,
    pub issuer: String,
    /// Subject public key, PEM for P-256 keys or hex for Ed25519 authority keys
    pub public_key: String,
    /// Fingerprint of the issuing credential; `None` for a self-issued root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Validity window start (ms since epoch)
    pub not_before: u64,
    /// Validity window end (ms since epoch)
    pub not_after: u64,
    #[serde(default)]
    pub extensions: Vec<Extension>,
    #[serde(default, with = "b64")]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct ToBeSigned<'a> {
    serial: &'a str,
    subject: &'a str,
    issuer: &'a str,
    public_key: &'a str,
    parent: &'a Option<String>,
    not_before: u64,
    not_after: u64,
    extensions: &'a [Extension],
}

impl Credential {
    /// Canonical bytes covered by the issuer signature.
    pub fn tbs_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&ToBeSigned {
            serial: &self.serial,
            subject: &self.subject,
            issuer: &self.issuer,
            public_key: &self.public_key,
            parent: &self.parent,
            not_before: self.not_before,
            not_after: self.not_after,
            extensions: &self.extensions,
        })?)
    }

    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.tbs_bytes()?);
        hasher.update(&self.signature);
        Ok(hasher.finalize().to_hex().to_string())
    }

    pub fn extension(&self, oid: &str) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.oid == oid)
    }

    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms >= self.not_before && now_ms < self.not_after
    }

    /// Verify the signature under an Ed25519 authority key given as hex.
    pub fn verify_signature(&self, issuer_key_hex: &str) -> Result<()> {
        let key_bytes: [u8; 32] = hex::decode(issuer_key_hex)
            .map_err(|e| Error::Crypto(format!("issuer key not hex: {}", e)))?
            .try_into()
            .map_err(|_| Error::Crypto("issuer key must be 32 bytes".to_string()))?;
        let key = Ed25519VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| Error::Crypto(format!("invalid issuer key: {}", e)))?;
        let signature = Ed25519Signature::from_slice(&self.signature)
            .map_err(|e| Error::Crypto(format!("invalid signature encoding: {}", e)))?;
        key.verify(&self.tbs_bytes()?, &signature)
            .map_err(|_| Error::Crypto(format!("signature on {} does not verify", self.subject)))
    }
}

/// Intermediate credential issued to a hardware-attested agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentCredential(Credential);

impl AgentCredential {
    pub fn new(credential: Credential) -> Self {
        Self(credential)
    }

    pub fn credential(&self) -> &Credential {
        &self.0
    }

    pub fn into_inner(self) -> Credential {
        self.0
    }

    /// Raw extension bytes, exactly as embedded at issuance.
    pub fn claims_bytes(&self) -> Option<&[u8]> {
        self.0.extension(ATTESTED_CLAIMS_OID).map(|e| e.value.as_slice())
    }

    pub fn attested_claims(&self) -> Result<Option<AttestedClaims>> {
        self.claims_bytes().map(AttestedClaims::from_bytes).transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySource {
    #[serde(rename = "tpm-app-key")]
    TpmAppKey,
    #[serde(rename = "workload-key")]
    WorkloadKey,
}

/// Workload-scoped claims; never hardware or geolocation fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkloadClaims {
    pub workload_id: String,
    pub key_source: KeySource,
}

/// Leaf credential; trusts the chain for hardware provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WorkloadCredential(Credential);

impl WorkloadCredential {
    /// Wrap a credential, refusing any hardware or geolocation claim.
    pub fn new(credential: Credential) -> Result<Self> {
        ensure_workload_scoped(&credential)?;
        Ok(Self(credential))
    }

    pub fn credential(&self) -> &Credential {
        &self.0
    }

    pub fn workload_claims(&self) -> Result<Option<WorkloadClaims>> {
        self.0
            .extension(WORKLOAD_CLAIMS_OID)
            .map(|e| serde_json::from_slice(&e.value).map_err(Error::from))
            .transpose()
    }
}

impl<'de> Deserialize<'de> for WorkloadCredential {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let credential = Credential::deserialize(deserializer)?;
        WorkloadCredential::new(credential).map_err(serde::de::Error::custom)
    }
}

fn ensure_workload_scoped(credential: &Credential) -> Result<()> {
    if credential.extension(ATTESTED_CLAIMS_OID).is_some() {
        return Err(Error::InvalidState(
            "workload credential must not carry attested hardware claims".to_string(),
        ));
    }
    for extension in &credential.extensions {
        let Ok(serde_json::Value::Object(fields)) =
            serde_json::from_slice::<serde_json::Value>(&extension.value)
        else {
            continue;
        };
        if let Some(key) = HARDWARE_CLAIM_KEYS.iter().find(|k| fields.contains_key(**k)) {
            return Err(Error::InvalidState(format!(
                "workload credential extension {} carries '{}'",
                extension.oid, key
            )));
        }
    }
    Ok(())
}

/// Ordered chain `[workload (leaf), agent (intermediate), root]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialChain {
    pub workload: WorkloadCredential,
    pub agent: AgentCredential,
    pub root: Credential,
}

impl CredentialChain {
    pub fn as_list(&self) -> [&Credential; 3] {
        [self.workload.credential(), self.agent.credential(), &self.root]
    }

    /// Check linkage, signatures, validity windows and the workload invariant.
    ///
    /// Every credential is signed by the issuing authority whose key is the
    /// root's public key; `issuer`/`parent` fields express the chain order.
    pub fn validate(&self, now_ms: u64) -> Result<()> {
        let [workload, agent, root] = self.as_list();

        if root.issuer != root.subject || root.parent.is_some() {
            return Err(Error::InvalidState("root credential is not self-issued".to_string()));
        }
        link(agent, root)?;
        link(workload, agent)?;

        for credential in self.as_list() {
            credential.verify_signature(&root.public_key)?;
            if !credential.is_valid_at(now_ms) {
                return Err(Error::InvalidState(format!(
                    "credential {} outside validity window",
                    credential.subject
                )));
            }
        }
        if workload.not_after > agent.not_after {
            return Err(Error::InvalidState(
                "workload credential outlives its agent credential".to_string(),
            ));
        }
        ensure_workload_scoped(workload)?;

        debug!(subject = %workload.subject, "CredentialChain :: Validated");
        Ok(())
    }
}

fn link(child: &Credential, parent: &Credential) -> Result<()> {
    if child.issuer != parent.subject {
        return Err(Error::InvalidState(format!(
            "{} issued by {} but parent is {}",
            child.subject, child.issuer, parent.subject
        )));
    }
    if child.parent.as_deref() != Some(parent.fingerprint()?.as_str()) {
        return Err(Error::InvalidState(format!(
            "{} does not reference its parent credential",
            child.subject
        )));
    }
    Ok(())
}
