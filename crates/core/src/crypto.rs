//! Hash bindings and P-256 helpers shared by prover and verifier.

use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p256::PublicKey;
use sha2::{Digest, Sha256};

use crate::attest::TPM_ALG_SHA256;
use crate::error::{Error, Result};
use crate::types::GeolocationClaim;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// `SHA-256(app_key_public || challenge_nonce)`, the value carried in the
/// certify-info `extraData`.
pub fn qualifying_data(app_key_public_pem: &str, challenge_nonce: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(app_key_public_pem.as_bytes());
    hasher.update(challenge_nonce.as_bytes());
    hasher.finalize().into()
}

/// TPM object name of an application key: `alg || SHA-256(public)`.
pub fn object_name(public_pem: &str) -> Vec<u8> {
    let mut name = TPM_ALG_SHA256.to_be_bytes().to_vec();
    name.extend_from_slice(&sha256(public_pem.as_bytes()));
    name
}

/// `SHA-256(claim_json || nonce)`
pub fn geolocation_measurement(claim: &GeolocationClaim, nonce: &str) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(claim.canonical_bytes()?);
    hasher.update(nonce.as_bytes());
    Ok(hasher.finalize().into())
}

/// PCR extend: `new = SHA-256(old || measurement)`.
pub fn pcr_extend(current: &[u8], measurement: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(current);
    hasher.update(measurement);
    hasher.finalize().into()
}

/// Register value after resetting PCR 15 and extending the claim once.
pub fn expected_geolocation_pcr(claim: &GeolocationClaim, nonce: &str) -> Result<[u8; 32]> {
    let measurement = geolocation_measurement(claim, nonce)?;
    Ok(pcr_extend(&[0u8; 32], &measurement))
}

pub fn parse_public_key_pem(pem: &str) -> Result<VerifyingKey> {
    let public_key = PublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| Error::Crypto(format!("invalid P-256 public key: {}", e)))?;
    Ok(VerifyingKey::from(&public_key))
}

pub fn encode_public_key_pem(key: &VerifyingKey) -> Result<String> {
    PublicKey::from(key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Crypto(format!("public key encoding failed: {}", e)))
}

/// Verify a DER ECDSA P-256/SHA-256 signature. Malformed input is `false`.
pub fn verify_ecdsa(key: &VerifyingKey, message: &[u8], signature_der: &[u8]) -> bool {
    match Signature::from_der(signature_der) {
        Ok(signature) => key.verify(message, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Length-aware comparison that does not short-circuit on content.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
