//! Location sensors feeding geolocation evidence.

use sovereign_core::config::SensorConfig;
use sovereign_core::{Error, GeolocationClaim, Result, SensorType};

/// Identity of the sensor attached to this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReading {
    pub sensor_type: SensorType,
    pub sensor_id: String,
    pub imei: Option<String>,
    pub imsi: Option<String>,
}

impl SensorReading {
    /// Bind the reading to a nonce. GNSS receivers carry no subscriber ids.
    pub fn into_claim(self, nonce: &str, pcr_index: u8) -> GeolocationClaim {
        let (sensor_imei, sensor_imsi) = match self.sensor_type {
            SensorType::Mobile => (self.imei, self.imsi),
            SensorType::Gnss => (None, None),
        };
        GeolocationClaim {
            sensor_type: self.sensor_type,
            sensor_id: self.sensor_id,
            sensor_imei,
            sensor_imsi,
            pcr_index,
            nonce: nonce.to_string(),
        }
    }
}

pub trait LocationSensor: Send + Sync {
    /// `Ok(None)` when no sensor is present; `Err` when one is present but unreadable.
    fn read(&self) -> Result<Option<SensorReading>>;
}

/// Sensor described in configuration.
#[derive(Debug, Clone)]
pub struct StaticSensor {
    reading: SensorReading,
}

impl StaticSensor {
    pub fn new(reading: SensorReading) -> Self {
        Self { reading }
    }

    /// `None` when the `[sensor]` section names no sensor type.
    pub fn from_config(config: &SensorConfig) -> Result<Option<Self>> {
        let Some(sensor_type) = config.sensor_type else {
            return Ok(None);
        };
        let sensor_id = config
            .sensor_id
            .clone()
            .ok_or_else(|| Error::Config("sensor.sensor_id is required".to_string()))?;
        Ok(Some(Self::new(SensorReading {
            sensor_type,
            sensor_id,
            imei: config.imei.clone(),
            imsi: config.imsi.clone(),
        })))
    }
}

impl LocationSensor for StaticSensor {
    fn read(&self) -> Result<Option<SensorReading>> {
        Ok(Some(self.reading.clone()))
    }
}
