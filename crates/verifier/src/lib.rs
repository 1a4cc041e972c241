//! Verifier side of the sovereign attestation protocol.
//!
//! [`engine::VerificationEngine`] resolves an agent through the registry,
//! checks the delegated certification, fetches a fresh quote and
//! geolocation claim from the agent's certification service, and consumes
//! the challenge nonce exactly once.

pub mod connector;
pub mod engine;
pub mod nonce;
pub mod policy;
pub mod registry;

pub use connector::{CertificationConnector, InProcessConnector, MtlsConnector};
pub use engine::VerificationEngine;
pub use nonce::NonceStore;
pub use policy::ClaimsPolicy;
pub use registry::{HttpRegistryClient, StaticRegistry};
