//! Issuing authority: the key every credential in the chain is signed with.

use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use tracing::info;

use sovereign_core::{current_timestamp, Credential, Error, Result};

/// Root validity of a locally generated authority.
const ROOT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);

pub trait IssuingAuthority: Send + Sync {
    /// Self-issued root credential; its `public_key` is the hex Ed25519 key.
    fn root(&self) -> &Credential;

    fn sign(&self, tbs: &[u8]) -> Result<Vec<u8>>;
}

/// In-process Ed25519 authority for single-node deployments and tests.
pub struct LocalAuthority {
    signing_key: SigningKey,
    root: Credential,
}

impl LocalAuthority {
    pub fn generate(trust_domain: &str) -> Result<Self> {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::from_key(&secret, trust_domain)
    }

    pub fn from_key(key_bytes: &[u8], trust_domain: &str) -> Result<Self> {
        let key: [u8; 32] = key_bytes.try_into().map_err(|_| {
            Error::Config(format!("authority key is {} bytes, expected 32", key_bytes.len()))
        })?;
        let signing_key = SigningKey::from_bytes(&key);
        let public_key = hex::encode(signing_key.verifying_key().as_bytes());
        let subject = format!("spiffe://{}", trust_domain);
        let now = current_timestamp();

        let mut root = Credential {
            serial: key_id(&public_key),
            subject: subject.clone(),
            issuer: subject,
            public_key,
            parent: None,
            not_before: now,
            not_after: now.saturating_add(ROOT_VALIDITY.as_millis() as u64),
            extensions: Vec::new(),
            signature: Vec::new(),
        };
        root.signature = signing_key.sign(&root.tbs_bytes()?).to_bytes().to_vec();

        info!(
            trust_domain,
            key_id = %root.serial,
            "STATUS: IssuingAuthority :: Local Ed25519 root :: ACTIVE"
        );
        Ok(Self { signing_key, root })
    }
}

impl IssuingAuthority for LocalAuthority {
    fn root(&self) -> &Credential {
        &self.root
    }

    fn sign(&self, tbs: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(tbs).to_bytes().to_vec())
    }
}

fn key_id(public_key_hex: &str) -> String {
    let hash = blake3::hash(public_key_hex.as_bytes());
    hex::encode(&hash.as_bytes()[..16])
}
