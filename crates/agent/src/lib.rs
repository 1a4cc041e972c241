//! Attesting agent.
//!
//! [`state::AttestationBuilder`] tracks one attestation cycle;
//! [`driver::AttestationAgent`] runs cycles against an identity server,
//! retrying transient failures with a fresh nonce, and binds the issued
//! credential to the TPM application key for transport signing.

pub mod driver;
pub mod http;
pub mod state;

pub use driver::AttestationAgent;
pub use http::HttpAttestationServer;
pub use state::{AttestationBuilder, BuilderState, StateTransition};
