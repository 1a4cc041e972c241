//! On-disk EK and AK material for the software backend.
//!
//! Plays the part of a hardware TPM's persistent handles: the EK and AK
//! survive a restart, the application key never touches disk.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use p256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};

use sovereign_core::{Error, Result};

const KEY_STORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoredKeys {
    version: u32,
    endorsement_key: String,
    attestation_key: String,
}

pub(crate) struct PersistedKeys {
    pub endorsement_key: SigningKey,
    pub attestation_key: SigningKey,
}

impl PersistedKeys {
    pub fn generate() -> Self {
        Self {
            endorsement_key: SigningKey::random(&mut rand::thread_rng()),
            attestation_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }
}

/// `Ok(None)` when nothing has been stored at `path` yet.
pub(crate) fn load(path: &Path) -> Result<Option<PersistedKeys>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let stored: StoredKeys = serde_json::from_slice(&contents)
        .map_err(|e| Error::Config(format!("key store {}: {}", path.display(), e)))?;
    if stored.version != KEY_STORE_VERSION {
        return Err(Error::Config(format!(
            "key store {} has version {}, expected {}",
            path.display(),
            stored.version,
            KEY_STORE_VERSION
        )));
    }
    Ok(Some(PersistedKeys {
        endorsement_key: decode_key(path, "endorsement_key", &stored.endorsement_key)?,
        attestation_key: decode_key(path, "attestation_key", &stored.attestation_key)?,
    }))
}

/// Write a new key store, owner read/write only. Never overwrites.
pub(crate) fn save(path: &Path, keys: &PersistedKeys) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let stored = StoredKeys {
        version: KEY_STORE_VERSION,
        endorsement_key: STANDARD.encode(keys.endorsement_key.to_bytes()),
        attestation_key: STANDARD.encode(keys.attestation_key.to_bytes()),
    };
    let json = serde_json::to_vec_pretty(&stored)?;
    let mut file = create_private(path)?;
    file.write_all(&json)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

fn decode_key(path: &Path, field: &str, encoded: &str) -> Result<SigningKey> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::Config(format!("key store {}: {}: {}", path.display(), field, e)))?;
    SigningKey::from_slice(&bytes).map_err(|_| {
        Error::Config(format!(
            "key store {}: {} is not a P-256 private key",
            path.display(),
            field
        ))
    })
}
