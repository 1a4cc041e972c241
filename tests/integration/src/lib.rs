//! End-to-end tests for the sovereign attestation stack
//!
//! This suite drives real components together, in process:
//! - attesting agent against the identity server over a software TPM
//! - verification outcomes for honest and tampered hosts
//! - nonce single use under concurrent submission
//! - credential chain composition and transport signing

pub mod test_utils;

#[cfg(test)]
mod attestation_scenarios;

#[cfg(test)]
mod nonce_binding_tests;

#[cfg(test)]
mod credential_chain_tests;

#[cfg(test)]
mod resilience_tests;
