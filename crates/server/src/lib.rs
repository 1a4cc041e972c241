//! Identity server for the sovereign attestation protocol.
//!
//! [`orchestrator::AttestationOrchestrator`] is a thin pass-through: it
//! issues nonces, hands attestation messages to the verification engine and
//! composes credentials from the resulting claims.

pub mod authority;
pub mod capability;
pub mod composer;
pub mod http;
pub mod orchestrator;

pub use authority::{IssuingAuthority, LocalAuthority};
pub use capability::CapabilitySet;
pub use composer::CredentialComposer;
pub use orchestrator::AttestationOrchestrator;
