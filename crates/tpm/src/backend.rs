//! TPM backends.
//!
//! [`TpmBackend`] is the raw, single-threaded command surface of one TPM.
//! Only the actor in [`crate::actor`] owns a backend; every other component
//! reaches it through a scoped handle.

use std::path::Path;

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use tracing::{info, warn};

use sovereign_core::attest::CertifyInfo;
use sovereign_core::crypto::{encode_public_key_pem, object_name, pcr_extend};
use sovereign_core::{
    AppKeyCertificate, Error, HashAlgorithm, PcrValue, Result, SignatureScheme, TpmQuote,
};

use crate::keystore::{self, PersistedKeys};

/// Number of PCRs in the SHA-256 bank.
pub const PCR_COUNT: usize = 24;

/// Size of a SHA-256 PCR.
pub const PCR_SIZE: usize = 32;

/// PCRs included in every quote.
pub const DEFAULT_QUOTE_SELECTION: &[u8] = &[0, 1, 2, 3, 7, 15];

/// Raw TPM command surface.
pub trait TpmBackend: Send + 'static {
    fn endorsement_key_public(&self) -> Result<String>;

    fn attestation_key_public(&self) -> Result<String>;

    /// EK signature (DER) over the AK public PEM.
    fn attestation_key_certificate(&self) -> Result<Vec<u8>>;

    /// Replace the application key; returns the new public PEM.
    fn create_application_key(&mut self) -> Result<String>;

    fn application_key_public(&self) -> Result<String>;

    /// Sign a precomputed digest with the application key.
    fn sign_digest(
        &mut self,
        digest: &[u8],
        hash_alg: HashAlgorithm,
        scheme: SignatureScheme,
    ) -> Result<Vec<u8>>;

    /// AK-certify the resident application key with caller qualifying data.
    fn certify(&mut self, app_key_public: &str, qualifying_data: &[u8]) -> Result<AppKeyCertificate>;

    fn pcr_reset(&mut self, index: u8) -> Result<()>;

    fn pcr_extend(&mut self, index: u8, measurement: &[u8]) -> Result<()>;

    fn pcr_read(&self, index: u8) -> Result<Vec<u8>>;

    /// AK-signed quote over `selection` and `nonce`.
    fn quote(&mut self, nonce: &str, selection: &[u8]) -> Result<TpmQuote>;
}

/// In-memory TPM with P-256 keys, used when no hardware is present.
pub struct SoftwareTpm {
    ek: SigningKey,
    ak: SigningKey,
    ak_certificate: Vec<u8>,
    app_key: Option<SigningKey>,
    pcrs: [[u8; PCR_SIZE]; PCR_COUNT],
    clock: u64,
}

impl std::fmt::Debug for SoftwareTpm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareTpm")
            .field("app_key_loaded", &self.app_key.is_some())
            .field("clock", &self.clock)
            .finish()
    }
}

impl SoftwareTpm {
    /// Create a fresh EK and AK held in memory only.
    pub fn provision() -> Result<Self> {
        Self::from_keys(PersistedKeys::generate())
    }

    /// Restore EK and AK from `path`, creating the store on first start.
    ///
    /// The application key is still regenerated by every process.
    pub fn load_or_provision(path: &Path) -> Result<Self> {
        let keys = match keystore::load(path)? {
            Some(keys) => {
                info!(path = %path.display(), "SoftwareTpm :: EK/AK restored from key store");
                keys
            }
            None => {
                let keys = PersistedKeys::generate();
                keystore::save(path, &keys)?;
                info!(path = %path.display(), "SoftwareTpm :: EK/AK provisioned into key store");
                keys
            }
        };
        Self::from_keys(keys)
    }

    /// The AK is certified by the EK.
    fn from_keys(keys: PersistedKeys) -> Result<Self> {
        if detect_hardware() {
            info!("STATUS: SoftwareTpm :: Hardware TPM present but not bound :: STUBBED");
        } else {
            warn!("STATUS: TpmBackend :: Hardware Root of Trust :: STUBBED");
        }
        let PersistedKeys {
            endorsement_key: ek,
            attestation_key: ak,
        } = keys;
        let ak_pem = encode_public_key_pem(ak.verifying_key())?;
        let ak_signature: Signature = ek.sign(ak_pem.as_bytes());
        Ok(Self {
            ek,
            ak,
            ak_certificate: ak_signature.to_der().as_bytes().to_vec(),
            app_key: None,
            pcrs: [[0u8; PCR_SIZE]; PCR_COUNT],
            clock: 0,
        })
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn loaded_app_key(&self) -> Result<&SigningKey> {
        self.app_key
            .as_ref()
            .ok_or_else(|| Error::InvalidState("no application key loaded".to_string()))
    }

    fn pcr_slot(&mut self, index: u8) -> Result<&mut [u8; PCR_SIZE]> {
        self.pcrs
            .get_mut(index as usize)
            .ok_or_else(|| Error::InvalidRequest(format!("PCR index {} out of range", index)))
    }
}

#[cfg(feature = "hardware-tpm")]
fn detect_hardware() -> bool {
    std::path::Path::new("/dev/tpm0").exists() || std::path::Path::new("/dev/tpmrm0").exists()
}

#[cfg(not(feature = "hardware-tpm"))]
fn detect_hardware() -> bool {
    false
}

impl TpmBackend for SoftwareTpm {
    fn endorsement_key_public(&self) -> Result<String> {
        encode_public_key_pem(self.ek.verifying_key())
    }

    fn attestation_key_public(&self) -> Result<String> {
        encode_public_key_pem(self.ak.verifying_key())
    }

    fn attestation_key_certificate(&self) -> Result<Vec<u8>> {
        Ok(self.ak_certificate.clone())
    }

    fn create_application_key(&mut self) -> Result<String> {
        let key = SigningKey::random(&mut rand::thread_rng());
        let pem = encode_public_key_pem(key.verifying_key())?;
        self.app_key = Some(key);
        self.tick();
        Ok(pem)
    }

    fn application_key_public(&self) -> Result<String> {
        encode_public_key_pem(self.loaded_app_key()?.verifying_key())
    }

    fn sign_digest(
        &mut self,
        digest: &[u8],
        hash_alg: HashAlgorithm,
        scheme: SignatureScheme,
    ) -> Result<Vec<u8>> {
        if scheme != SignatureScheme::Ecdsa {
            return Err(Error::Unsupported(format!(
                "{:?} signing with a P-256 application key",
                scheme
            )));
        }
        if digest.len() != hash_alg.digest_len() {
            return Err(Error::InvalidRequest(format!(
                "{}-byte digest does not match {:?}",
                digest.len(),
                hash_alg
            )));
        }
        let signature: Signature = self
            .loaded_app_key()?
            .sign_prehash(digest)
            .map_err(|e| Error::HardwareFault(format!("sign failed: {}", e)))?;
        self.tick();
        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn certify(&mut self, app_key_public: &str, qualifying_data: &[u8]) -> Result<AppKeyCertificate> {
        let resident = self.application_key_public()?;
        if resident.trim() != app_key_public.trim() {
            return Err(Error::InvalidRequest(
                "application key is not resident in this TPM".to_string(),
            ));
        }
        let info = CertifyInfo {
            qualified_signer: object_name(&self.attestation_key_public()?),
            extra_data: qualifying_data.to_vec(),
            clock: self.tick(),
            certified_name: object_name(&resident),
        };
        let certify_data = info.marshal();
        let signature: Signature = self.ak.sign(&certify_data);
        Ok(AppKeyCertificate {
            certify_data,
            signature: signature.to_der().as_bytes().to_vec(),
        })
    }

    fn pcr_reset(&mut self, index: u8) -> Result<()> {
        *self.pcr_slot(index)? = [0u8; PCR_SIZE];
        Ok(())
    }

    fn pcr_extend(&mut self, index: u8, measurement: &[u8]) -> Result<()> {
        let slot = self.pcr_slot(index)?;
        *slot = pcr_extend(slot.as_slice(), measurement);
        Ok(())
    }

    fn pcr_read(&self, index: u8) -> Result<Vec<u8>> {
        self.pcrs
            .get(index as usize)
            .map(|v| v.to_vec())
            .ok_or_else(|| Error::InvalidRequest(format!("PCR index {} out of range", index)))
    }

    fn quote(&mut self, nonce: &str, selection: &[u8]) -> Result<TpmQuote> {
        let mut indices = selection.to_vec();
        indices.sort_unstable();
        indices.dedup();
        let pcr_values = indices
            .into_iter()
            .map(|index| {
                Ok(PcrValue {
                    index,
                    value: self.pcr_read(index)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let signature: Signature = self.ak.sign(&TpmQuote::signed_message(&pcr_values, nonce)?);
        self.tick();
        Ok(TpmQuote {
            pcr_values,
            nonce: nonce.to_string(),
            signature: signature.to_der().as_bytes().to_vec(),
        })
    }
}
