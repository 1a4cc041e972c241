//! Data model shared by the agent, the hardware services and the verifier.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// PCR reserved for the geolocation measurement.
pub const GEOLOCATION_PCR_INDEX: u8 = 15;

/// Random bytes in a challenge nonce.
pub const NONCE_LEN: usize = 32;

/// Current Unix time in milliseconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Base64 (standard alphabet) encoding for binary fields.
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Server-issued, single-use, expiring challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeNonce {
    /// Hex-encoded random value
    pub value: String,
    /// Issue time (ms since epoch)
    pub issued_at: u64,
    /// Expiry (ms since epoch)
    pub expires_at: u64,
}

impl ChallengeNonce {
    pub fn generate(ttl: Duration) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        let issued_at = current_timestamp();
        Self {
            value: hex::encode(bytes),
            issued_at,
            expires_at: issued_at.saturating_add(ttl.as_millis() as u64),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp())
    }
}

/// One logical attestation session: `agent_id + challenge_nonce`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub agent_id: String,
    pub nonce: String,
}

impl SessionId {
    pub fn new(agent_id: impl Into<String>, nonce: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            nonce: nonce.into(),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.nonce.get(..12).unwrap_or(&self.nonce);
        write!(f, "{}/{}", self.agent_id, short)
    }
}

/// AK certification of an application key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppKeyCertificate {
    /// Marshalled [`crate::attest::CertifyInfo`]
    #[serde(with = "b64")]
    pub certify_data: Vec<u8>,
    /// DER ECDSA signature by the AK over `certify_data`
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl AppKeyCertificate {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Agent to server message, built once per attestation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationMessage {
    /// PEM-encoded SubjectPublicKeyInfo of the application key
    pub app_key_public: String,
    pub app_key_certificate: AppKeyCertificate,
    pub challenge_nonce: String,
    pub agent_id: String,
    /// Left empty by the builder; the verifier fetches a fresh quote itself.
    #[serde(default, with = "b64")]
    pub quote: Vec<u8>,
}

impl AttestationMessage {
    pub fn session(&self) -> SessionId {
        SessionId::new(&self.agent_id, &self.challenge_nonce)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrValue {
    pub index: u8,
    #[serde(with = "b64")]
    pub value: Vec<u8>,
}

/// AK-signed PCR snapshot bound to a nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmQuote {
    pub pcr_values: Vec<PcrValue>,
    pub nonce: String,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl TpmQuote {
    /// Bytes covered by the quote signature: each PCR as
    /// `index || len(u16 BE) || value`, then the nonce.
    ///
    /// Values longer than `u16::MAX` bytes have no encoding and are refused.
    pub fn signed_message(pcr_values: &[PcrValue], nonce: &str) -> Result<Vec<u8>> {
        let mut message = Vec::with_capacity(pcr_values.len() * 35 + nonce.len());
        for pcr in pcr_values {
            let len = u16::try_from(pcr.value.len()).map_err(|_| {
                Error::InvalidRequest(format!(
                    "PCR {} value of {} bytes cannot be quoted",
                    pcr.index,
                    pcr.value.len()
                ))
            })?;
            message.push(pcr.index);
            message.extend_from_slice(&len.to_be_bytes());
            message.extend_from_slice(&pcr.value);
        }
        message.extend_from_slice(nonce.as_bytes());
        Ok(message)
    }

    pub fn message(&self) -> Result<Vec<u8>> {
        Self::signed_message(&self.pcr_values, &self.nonce)
    }

    pub fn pcr(&self, index: u8) -> Option<&PcrValue> {
        self.pcr_values.iter().find(|p| p.index == index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Mobile,
    Gnss,
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Mobile => write!(f, "mobile"),
            SensorType::Gnss => write!(f, "gnss"),
        }
    }
}

/// Location reading bound to a nonce and extended into PCR 15.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeolocationClaim {
    pub sensor_type: SensorType,
    pub sensor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_imei: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_imsi: Option<String>,
    pub pcr_index: u8,
    pub nonce: String,
}

impl GeolocationClaim {
    /// Serialized form that is hashed into PCR 15.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareAttestation {
    pub app_key_certified: bool,
    pub quote_verified: bool,
}

/// Verification result. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<GeolocationClaim>,
    pub hardware_attestation: HardwareAttestation,
}

impl AttestedClaims {
    /// Claims for a cycle where every verification step passed.
    pub fn verified(geolocation: Option<GeolocationClaim>) -> Self {
        Self {
            geolocation,
            hardware_attestation: HardwareAttestation {
                app_key_certified: true,
                quote_verified: true,
            },
        }
    }

    pub fn is_fully_verified(&self) -> bool {
        self.hardware_attestation.app_key_certified && self.hardware_attestation.quote_verified
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Registry view of a registered agent. Read-only for the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    #[serde(default)]
    pub agent_id: String,
    pub ip: String,
    pub port: u16,
    /// PEM-encoded AK public key
    pub ak_public: String,
    /// PEM-encoded certificate presented by the certification service
    pub transport_cert: String,
}

impl RegistryRecord {
    /// `host:port`, bracketing IPv6 literals.
    pub fn network_address(&self) -> String {
        match self.ip.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.ip, self.port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Infer the algorithm from a precomputed digest.
    pub fn from_digest_len(len: usize) -> Result<Self> {
        match len {
            32 => Ok(HashAlgorithm::Sha256),
            48 => Ok(HashAlgorithm::Sha384),
            64 => Ok(HashAlgorithm::Sha512),
            other => Err(Error::InvalidRequest(format!(
                "no hash algorithm produces a {}-byte digest",
                other
            ))),
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureScheme {
    #[serde(rename = "ecdsa")]
    Ecdsa,
    #[serde(rename = "rsa-pss")]
    RsaPss,
    #[serde(rename = "rsa-pkcs1v15")]
    RsaPkcs1v15,
}
