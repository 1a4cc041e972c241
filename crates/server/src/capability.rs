//! Capability set selected at configuration time.

use std::collections::HashSet;

use tracing::info;

use sovereign_core::config::CapabilityConfig;
use sovereign_core::{Capability, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    enabled: HashSet<Capability>,
}

impl CapabilitySet {
    pub fn from_config(config: &CapabilityConfig) -> Self {
        let enabled: HashSet<Capability> = config.enabled.iter().copied().collect();
        info!(capabilities = ?enabled, "STATUS: CapabilitySet :: Configured");
        Self { enabled }
    }

    pub fn all() -> Self {
        Self::from_config(&CapabilityConfig::default())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.contains(capability) {
            Ok(())
        } else {
            Err(Error::Unsupported(format!("capability {:?} is not enabled", capability)))
        }
    }
}
