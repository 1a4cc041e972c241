//! Challenge nonce store.
//!
//! The only mutable state shared across concurrent verifications. Consumption
//! is a single check-and-set under one write lock, so two verifications of
//! the same nonce can never both succeed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use sovereign_core::{
    current_timestamp, ChallengeNonce, Error, Result, SessionId, VerificationFailure,
};

#[derive(Debug, Clone)]
struct NonceRecord {
    agent_id: String,
    expires_at: u64,
    consumed: bool,
}

impl NonceRecord {
    fn validate(&self, session: &SessionId, now: u64) -> Result<()> {
        if self.consumed {
            return Err(VerificationFailure::NonceReused.into());
        }
        if self.agent_id != session.agent_id {
            return Err(VerificationFailure::NonceMismatch.into());
        }
        if now >= self.expires_at {
            return Err(VerificationFailure::NonceExpired.into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NonceStore {
    ttl: Duration,
    capacity: usize,
    records: Arc<RwLock<HashMap<String, NonceRecord>>>,
}

impl NonceStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn lock_err<E: std::fmt::Display>(e: E) -> Error {
        Error::InvalidState(format!("nonce store lock poisoned: {}", e))
    }

    /// Issue a fresh nonce bound to `agent_id`.
    pub fn issue(&self, agent_id: &str) -> Result<ChallengeNonce> {
        let nonce = ChallengeNonce::generate(self.ttl);
        let mut records = self.records.write().map_err(Self::lock_err)?;

        let now = current_timestamp();
        records.retain(|_, record| record.expires_at > now);
        if records.len() >= self.capacity {
            warn!(outstanding = records.len(), "NonceStore :: Capacity reached");
            return Err(Error::RateLimited {
                caller: agent_id.to_string(),
                retry_after: Duration::from_secs(1),
            });
        }

        records.insert(
            nonce.value.clone(),
            NonceRecord {
                agent_id: agent_id.to_string(),
                expires_at: nonce.expires_at,
                consumed: false,
            },
        );
        debug!(agent_id, "NonceStore :: Nonce issued");
        Ok(nonce)
    }

    /// Non-mutating usability check, for failing fast before expensive steps.
    pub fn check(&self, session: &SessionId) -> Result<()> {
        let records = self.records.read().map_err(Self::lock_err)?;
        match records.get(&session.nonce) {
            Some(record) => record.validate(session, current_timestamp()),
            None => Err(VerificationFailure::NonceUnknown.into()),
        }
    }

    /// Atomically mark the nonce used. Exactly one caller wins.
    pub fn consume(&self, session: &SessionId) -> Result<()> {
        let mut records = self.records.write().map_err(Self::lock_err)?;
        let record = records
            .get_mut(&session.nonce)
            .ok_or(Error::VerificationFailed(VerificationFailure::NonceUnknown))?;
        record.validate(session, current_timestamp())?;
        record.consumed = true;
        debug!(session = %session, "NonceStore :: Nonce consumed");
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        self.records
            .read()
            .map(|records| records.values().filter(|r| !r.consumed).count())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn expire_now(&self, nonce: &str) {
        if let Ok(mut records) = self.records.write() {
            if let Some(record) = records.get_mut(nonce) {
                record.expires_at = 0;
            }
        }
    }
}
