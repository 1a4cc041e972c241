//! Core types for the sovereign attestation protocol.
//!
//! This crate provides the data model, error taxonomy, configuration,
//! hash bindings and service traits shared by the hardware services,
//! the attesting agent and the verifier.

pub mod attest;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod services;
pub mod types;

pub use attest::CertifyInfo;
pub use config::{Capability, Config};
pub use credential::{
    AgentCredential, Credential, CredentialChain, Extension, KeySource, WorkloadClaims,
    WorkloadCredential, ATTESTED_CLAIMS_OID, WORKLOAD_CLAIMS_OID,
};
pub use error::{Error, ErrorClass, Rejection, Result, VerificationFailure};
pub use services::{
    AttestationKeyResponse, AttestationServer, CertificationService, CertifyResponse,
    ChallengeRequest, QuoteResponse, RegistryLookup, WorkloadRequest,
};
pub use types::{
    current_timestamp, AppKeyCertificate, AttestationMessage, AttestedClaims, ChallengeNonce,
    GeolocationClaim, HardwareAttestation, HashAlgorithm, PcrValue, RegistryRecord, SensorType,
    SessionId, SignatureScheme, TpmQuote, GEOLOCATION_PCR_INDEX,
};
