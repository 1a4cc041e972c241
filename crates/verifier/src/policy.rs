//! Claims policy applied after the hardware evidence checks pass.

use tracing::warn;

use sovereign_core::config::ClaimsPolicyConfig;
use sovereign_core::{GeolocationClaim, Result, SensorType, VerificationFailure};

#[derive(Debug, Clone, Default)]
pub struct ClaimsPolicy {
    allowed_sensor_types: Vec<SensorType>,
    /// Exact ids, `*`, or `prefix*`
    allowed_sensor_ids: Vec<String>,
    require_geolocation: bool,
}

impl ClaimsPolicy {
    /// Accepts any claim, including none.
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ClaimsPolicyConfig) -> Self {
        Self {
            allowed_sensor_types: config.allowed_sensor_types.clone(),
            allowed_sensor_ids: config.allowed_sensor_ids.clone(),
            require_geolocation: config.require_geolocation,
        }
    }

    pub fn evaluate(&self, geolocation: Option<&GeolocationClaim>) -> Result<()> {
        let Some(claim) = geolocation else {
            if self.require_geolocation {
                return Err(violation("geolocation evidence required"));
            }
            return Ok(());
        };
        if !self.allowed_sensor_types.is_empty()
            && !self.allowed_sensor_types.contains(&claim.sensor_type)
        {
            return Err(violation(&format!("sensor type {} not allowed", claim.sensor_type)));
        }
        if !self.allowed_sensor_ids.is_empty()
            && !self
                .allowed_sensor_ids
                .iter()
                .any(|pattern| matches_pattern(pattern, &claim.sensor_id))
        {
            return Err(violation(&format!("sensor {} not allowed", claim.sensor_id)));
        }
        Ok(())
    }
}

fn violation(reason: &str) -> sovereign_core::Error {
    warn!(reason, "ClaimsPolicy :: Claim REJECTED");
    VerificationFailure::PolicyViolation(reason.to_string()).into()
}

fn matches_pattern(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}
