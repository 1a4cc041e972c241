//! Hardware-facing components of the sovereign attestation stack.
//!
//! One TPM is owned by a single actor ([`actor::TpmActor`]). Two components
//! share it through scoped handles:
//!
//! - [`gateway::HardwareKeyGateway`]: application key, signing, quote relay
//! - [`certification::DelegatedCertificationService`]: attestation key,
//!   certification, quotes and geolocation binding
//!
//! [`signer::TransportSigner`] and the [`ipc`] socket route post-attestation
//! transport signing through the gateway.

pub mod actor;
pub mod backend;
pub mod certification;
pub mod client;
pub mod gateway;
pub mod http;
#[cfg(unix)]
pub mod ipc;
mod keystore;
pub mod ratelimit;
pub mod sensor;
pub mod signer;

pub use actor::{KeyScope, TpmActor, TpmHandle, TpmPorts};
pub use backend::{SoftwareTpm, TpmBackend, DEFAULT_QUOTE_SELECTION};
pub use certification::{DelegatedCertificationService, LocalCertificationClient};
pub use client::{ClientIdentity, HttpCertificationClient};
pub use gateway::{HardwareKeyGateway, SignRequest};
pub use ratelimit::RateLimiter;
pub use sensor::{LocationSensor, SensorReading, StaticSensor};
pub use signer::TransportSigner;
