//! Per-caller sliding-window rate limiter for the certification service.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use sovereign_core::{Error, Result};

/// Callers tracked before idle entries are swept.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Requests allowed per window; 0 disables limiting
    limit: u32,
    window: Duration,
    requests: Arc<RwLock<HashMap<String, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            requests: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn check(&self, caller: &str) -> Result<()> {
        self.check_at(caller, Instant::now())
    }

    /// Record a request at `now`, or refuse it with the time until the
    /// oldest request in the window expires.
    pub fn check_at(&self, caller: &str, now: Instant) -> Result<()> {
        if self.limit == 0 {
            return Ok(());
        }
        let mut requests = self
            .requests
            .write()
            .map_err(|e| Error::InvalidState(format!("rate limiter lock poisoned: {}", e)))?;

        if requests.len() >= SWEEP_THRESHOLD {
            let window = self.window;
            requests.retain(|_, log| log.back().is_some_and(|t| now.duration_since(*t) < window));
        }

        let log = requests.entry(caller.to_string()).or_default();
        while log
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            log.pop_front();
        }

        if log.len() >= self.limit as usize {
            let oldest = log.front().copied().unwrap_or(now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(Error::RateLimited {
                caller: caller.to_string(),
                retry_after,
            });
        }
        log.push_back(now);
        Ok(())
    }
}
