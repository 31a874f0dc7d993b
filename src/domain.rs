//! ==============================================================================
//! domain.rs - shared telemetry types
//! ==============================================================================
//!
//! purpose:
//!     the values that flow through the pipeline.
//!     - Reading: one timestamped sensor value, immutable once created
//!     - SensorKey: the (room, sensor type) pair the registry indexes by
//!     - SensorDefinition: static per-sensor configuration from host.toml
//!
//! relationships:
//!     - produced by: source.rs (SensorSource::generate)
//!     - consumed by: registry.rs, batch.rs, broker.rs, server.rs
//!     - loaded by: config.rs ([[sensors]] tables)
//!
//! ==============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// the kinds of sensor the house is fitted with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    Energy,
}

impl SensorType {
    pub const ALL: [SensorType; 3] = [SensorType::Temperature, SensorType::Humidity, SensorType::Energy];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::Energy => "energy",
        }
    }

    /// unit attached to readings of this kind
    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::Temperature => "°C",
            SensorType::Humidity => "%",
            SensorType::Energy => "W",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(SensorType::Temperature),
            "humidity" => Ok(SensorType::Humidity),
            "energy" => Ok(SensorType::Energy),
            other => Err(Error::UnknownSensorType(other.to_string())),
        }
    }
}

/// registry key: one latest reading is kept per (room, sensor type)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SensorKey {
    pub room_id: String,
    pub sensor_type: SensorType,
}

impl SensorKey {
    pub fn new(room_id: impl Into<String>, sensor_type: SensorType) -> Self {
        Self { room_id: room_id.into(), sensor_type }
    }
}

/// a single timestamped sensor value
///
/// readings are never mutated after a source creates them. the pipeline
/// clones them into the registry, the batch and each subscriber queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// unique sensor identifier (e.g., "temp_kitchen_001")
    pub sensor_id: String,
    pub room_id: String,
    pub sensor_type: SensorType,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    /// extra per-kind fields, e.g. energy cost so far today
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Reading {
    pub fn key(&self) -> SensorKey {
        SensorKey::new(self.room_id.clone(), self.sensor_type)
    }
}

/// static configuration for one simulated sensor
///
/// loaded once at startup and copied by value into its SensorSource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDefinition {
    pub sensor_id: String,
    pub room_id: String,
    pub sensor_type: SensorType,
    /// centre value the simulation oscillates around
    pub base: f64,
    pub min: f64,
    pub max: f64,
    /// amplitude of the yearly sine (peak near midsummer); energy uses its
    /// magnitude so both summer and winter raise the draw
    #[serde(default)]
    pub seasonal_amplitude: f64,
    /// amplitude of the 24h sine
    #[serde(default)]
    pub daily_amplitude: f64,
    /// hour of day at which the daily component peaks
    #[serde(default = "default_peak_hour")]
    pub daily_peak_hour: f64,
    /// half-width of the uniform noise band
    #[serde(default)]
    pub noise: f64,
    /// 0.0 tracks the target exactly, values toward 1.0 follow it slowly
    #[serde(default)]
    pub inertia: f64,
    /// energy only: extra draw centred on `morning_peak_hour`
    #[serde(default)]
    pub morning_amplitude: f64,
    #[serde(default = "default_morning_peak")]
    pub morning_peak_hour: f64,
    /// energy only: extra draw centred on `evening_peak_hour`
    #[serde(default)]
    pub evening_amplitude: f64,
    #[serde(default = "default_evening_peak")]
    pub evening_peak_hour: f64,
    /// spread (standard deviation, hours) of the usage peaks
    #[serde(default = "default_peak_width")]
    pub peak_width_hours: f64,
    /// overrides the per-type interval from [intervals]
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

fn default_peak_hour() -> f64 {
    15.0
}

fn default_morning_peak() -> f64 {
    7.5
}

fn default_evening_peak() -> f64 {
    19.5
}

fn default_peak_width() -> f64 {
    1.0
}

impl SensorDefinition {
    /// a definition with no periodic components and no noise
    pub fn flat(
        sensor_id: impl Into<String>,
        room_id: impl Into<String>,
        sensor_type: SensorType,
        base: f64,
        min: f64,
        max: f64,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            room_id: room_id.into(),
            sensor_type,
            base,
            min,
            max,
            seasonal_amplitude: 0.0,
            daily_amplitude: 0.0,
            daily_peak_hour: default_peak_hour(),
            noise: 0.0,
            inertia: 0.0,
            morning_amplitude: 0.0,
            morning_peak_hour: default_morning_peak(),
            evening_amplitude: 0.0,
            evening_peak_hour: default_evening_peak(),
            peak_width_hours: default_peak_width(),
            interval_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_type_round_trips_through_str() {
        for kind in SensorType::ALL {
            assert_eq!(kind.as_str().parse::<SensorType>().unwrap(), kind);
        }
        assert!("pressure".parse::<SensorType>().is_err());
    }

    #[test]
    fn reading_serializes_snake_case_and_skips_empty_metadata() {
        let reading = Reading {
            sensor_id: "temp_kitchen_001".into(),
            room_id: "kitchen".into(),
            sensor_type: SensorType::Temperature,
            value: 22.5,
            unit: "°C".into(),
            timestamp: Utc::now(),
            metadata: None,
        };
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["sensor_type"], "temperature");
        assert!(json.get("metadata").is_none());
    }
}
