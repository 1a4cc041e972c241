//! Error taxonomy for the sovereign attestation protocol.
//!
//! Every failure carries an [`ErrorClass`] so callers can tell a transient
//! condition ("try again") from a fatal one ("fix configuration/hardware").
//! [`Rejection`] is the public projection handed back to an attesting agent;
//! it never contains verifier-internal key material.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a verification was refused. All kinds are terminal for the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "detail")]
pub enum VerificationFailure {
    #[error("agent not found in registry")]
    AgentNotFound,

    #[error("application key certificate signature invalid")]
    CertSignatureInvalid,

    #[error("qualifying data does not bind this key and nonce")]
    QualifyingDataMismatch,

    #[error("quote signature invalid")]
    QuoteSignatureInvalid,

    #[error("quote nonce does not match challenge")]
    NonceMismatch,

    #[error("challenge nonce already consumed")]
    NonceReused,

    #[error("challenge nonce expired")]
    NonceExpired,

    #[error("challenge nonce was never issued")]
    NonceUnknown,

    #[error("geolocation claim does not match attested PCR state")]
    GeolocationVerificationFailed,

    #[error("claims policy violation: {0}")]
    PolicyViolation(String),
}

impl VerificationFailure {
    /// Stable identifier used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AgentNotFound => "AgentNotFound",
            Self::CertSignatureInvalid => "CertSignatureInvalid",
            Self::QualifyingDataMismatch => "QualifyingDataMismatch",
            Self::QuoteSignatureInvalid => "QuoteSignatureInvalid",
            Self::NonceMismatch => "NonceMismatch",
            Self::NonceReused => "NonceReused",
            Self::NonceExpired => "NonceExpired",
            Self::NonceUnknown => "NonceUnknown",
            Self::GeolocationVerificationFailed => "GeolocationVerificationFailed",
            Self::PolicyViolation(_) => "PolicyViolation",
        }
    }
}

/// Coarse retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Retry with backoff and a fresh nonce.
    Transient,
    /// Terminal for the current cycle.
    Fatal,
}

/// Core error type for the sovereign attestation stack.
#[derive(Debug, Error)]
pub enum Error {
    /// Evidence was checked and refused
    #[error("verification failed: {0}")]
    VerificationFailed(VerificationFailure),

    /// Registry could not be reached
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// TPM busy, timed out or its queue is gone
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// TPM reported a non-recoverable failure
    #[error("hardware fault: {0}")]
    HardwareFault(String),

    /// Per-caller rate limit exceeded
    #[error("rate limited: caller {caller} may retry after {retry_after:?}")]
    RateLimited { caller: String, retry_after: Duration },

    /// Caller is not on the allow-list
    #[error("caller not allowed: {0}")]
    CallerNotAllowed(String),

    /// Round-trip to the certification service exceeded its deadline
    #[error("verifier timeout: {0}")]
    VerifierTimeout(String),

    /// Network failure talking to a peer
    #[error("transport error: {0}")]
    Transport(String),

    /// Rejection returned by a remote peer
    #[error("rejected by peer: {0}")]
    Rejected(Rejection),

    /// Malformed request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Capability or scheme not available
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Cryptographic errors
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sovereign operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<VerificationFailure> for Error {
    fn from(failure: VerificationFailure) -> Self {
        Error::VerificationFailed(failure)
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::RegistryUnavailable(_)
            | Error::HardwareUnavailable(_)
            | Error::VerifierTimeout(_)
            | Error::Transport(_)
            | Error::RateLimited { .. } => ErrorClass::Transient,
            Error::Rejected(rejection) if rejection.retryable => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// The verification failure kind, if this error (or a remote rejection) carries one.
    pub fn verification_failure(&self) -> Option<&VerificationFailure> {
        match self {
            Error::VerificationFailed(failure) => Some(failure),
            Error::Rejected(rejection) => rejection.failure.as_ref(),
            _ => None,
        }
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::VerificationFailed(failure) => failure.code(),
            Error::RegistryUnavailable(_) => "RegistryUnavailable",
            Error::HardwareUnavailable(_) => "HardwareUnavailable",
            Error::HardwareFault(_) => "HardwareFault",
            Error::RateLimited { .. } => "RateLimited",
            Error::CallerNotAllowed(_) => "CallerNotAllowed",
            Error::VerifierTimeout(_) => "VerifierTimeout",
            Error::Transport(_) => "Transport",
            Error::Rejected(_) => "Rejected",
            Error::InvalidRequest(_) => "InvalidRequest",
            Error::InvalidState(_) => "InvalidState",
            Error::Unsupported(_) => "Unsupported",
            Error::Crypto(_) => "Crypto",
            Error::Config(_) => "Config",
            Error::Serialization(_) => "Serialization",
            Error::Io(_) => "Io",
        }
    }

    /// HTTP status for this error on the service endpoints.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::VerificationFailed(_) | Error::CallerNotAllowed(_) | Error::Unsupported(_) => 403,
            Error::RateLimited { .. } => 429,
            Error::InvalidRequest(_) | Error::Serialization(_) => 400,
            Error::InvalidState(_) => 409,
            Error::RegistryUnavailable(_)
            | Error::HardwareUnavailable(_)
            | Error::VerifierTimeout(_)
            | Error::Transport(_) => 503,
            Error::Rejected(rejection) if rejection.retryable => 503,
            Error::Rejected(_) => 403,
            Error::HardwareFault(_) | Error::Crypto(_) | Error::Config(_) | Error::Io(_) => 500,
        }
    }

    /// Public rejection for an attesting agent.
    ///
    /// Internal detail (registry responses, key material, peer addresses) is
    /// replaced by a generic message; only the code and retry hint survive.
    pub fn to_rejection(&self) -> Rejection {
        if let Error::Rejected(rejection) = self {
            return rejection.clone();
        }
        let retryable = self.is_transient();
        let message = match self {
            Error::VerificationFailed(failure) => failure.to_string(),
            Error::RateLimited { retry_after, .. } => {
                format!("rate limited, retry after {}s", retry_after.as_secs().max(1))
            }
            Error::InvalidRequest(detail) => format!("invalid request: {}", detail),
            Error::Unsupported(detail) => format!("unsupported: {}", detail),
            _ if retryable => "temporarily unavailable, retry with a fresh nonce".to_string(),
            _ => "attestation refused".to_string(),
        };
        Rejection {
            code: self.code().to_string(),
            retryable,
            message,
            failure: self.verification_failure().cloned(),
            retry_after_secs: match self {
                Error::RateLimited { retry_after, .. } => Some(retry_after.as_secs().max(1)),
                _ => None,
            },
        }
    }
}

/// Rejection reason returned to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: String,
    pub retryable: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<VerificationFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hint = if self.retryable { "transient" } else { "fatal" };
        write!(f, "{} ({}): {}", self.code, hint, self.message)
    }
}

impl Rejection {
    /// Rebuild a local error from a peer's rejection, restoring the kinds the
    /// local code branches on.
    pub fn into_error(self) -> Error {
        match (self.code.as_str(), self.retry_after_secs) {
            ("RateLimited", Some(secs)) => Error::RateLimited {
                caller: "self".to_string(),
                retry_after: Duration::from_secs(secs),
            },
            ("CallerNotAllowed", _) => Error::CallerNotAllowed(self.message),
            ("HardwareUnavailable", _) => Error::HardwareUnavailable(self.message),
            ("HardwareFault", _) => Error::HardwareFault(self.message),
            ("Unsupported", _) => Error::Unsupported(self.message),
            _ => Error::Rejected(self),
        }
    }
}
