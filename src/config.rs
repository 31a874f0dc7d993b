//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: where the api and websocket listen.
//!     - LoggingConfig: level, output format, per-reading debug lines.
//!     - BatchingConfig: storage batch size/age and retry policy.
//!     - IntervalsConfig: default update cadence per sensor type.
//!     - BrokerConfig: per-subscriber queue depth.
//!     - StorageConfig: which sink flushed batches go to.
//!     - SimulationConfig: rng seed and shutdown budget.
//!     - sensors: ordered list of SensorDefinition records.
//!
//! the pipeline treats the loaded config as immutable for the process
//! lifetime.
//!
//! ==============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::batch::BatchConfig;
use crate::domain::{SensorDefinition, SensorType};
use crate::error::Error;
use crate::retry::RetryConfig;

/// Root configuration structure
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HostConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default = "default_sensors")]
    pub sensors: Vec<SensorDefinition>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8000 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error; RUST_LOG wins when set
    pub level: String,
    /// pretty, compact or json
    pub format: String,
    /// log every dispatched reading at debug level
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            show_sensor_data: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BatchingConfig {
    pub max_batch_size: usize,
    pub max_batch_age_ms: u64,
    /// total write attempts per batch before it is dropped
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub check_interval_ms: u64,
    pub queue_capacity: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_age_ms: 5_000,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            check_interval_ms: 250,
            queue_capacity: 64,
        }
    }
}

impl BatchingConfig {
    pub fn to_batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            max_batch_age: Duration::from_millis(self.max_batch_age_ms),
            check_interval: Duration::from_millis(self.check_interval_ms.max(1)),
            queue_capacity: self.queue_capacity,
            retry: RetryConfig {
                max_attempts: self.max_retries,
                multiplier: 2.0,
                initial_delay: Duration::from_millis(self.initial_backoff_ms),
                max_delay: Duration::from_millis(self.max_backoff_ms),
            },
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct IntervalsConfig {
    pub temperature_secs: u64,
    pub humidity_secs: u64,
    pub energy_secs: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            temperature_secs: 30,
            humidity_secs: 30,
            energy_secs: 60,
        }
    }
}

impl IntervalsConfig {
    pub fn for_type(&self, sensor_type: SensorType) -> Duration {
        let secs = match sensor_type {
            SensorType::Temperature => self.temperature_secs,
            SensorType::Humidity => self.humidity_secs,
            SensorType::Energy => self.energy_secs,
        };
        Duration::from_secs(secs)
    }

    /// a sensor's own interval wins over its type's default
    pub fn for_sensor(&self, sensor: &SensorDefinition) -> Duration {
        sensor
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.for_type(sensor.sensor_type))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub subscriber_queue: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { subscriber_queue: 256 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// "memory" or "influxdb"
    pub kind: String,
    /// points kept by the memory sink
    pub memory_capacity: usize,
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            memory_capacity: 10_000,
            url: String::new(),
            org: "smart-home".to_string(),
            bucket: "sensors".to_string(),
            token: String::new(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SimulationConfig {
    /// fixed seed for reproducible runs; each sensor derives its own
    pub seed: Option<u64>,
    pub shutdown_timeout_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { seed: None, shutdown_timeout_secs: 5 }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// first host.toml found in the usual places
    pub fn locate() -> Option<PathBuf> {
        let paths = [
            PathBuf::from("config").join("host.toml"),
            PathBuf::from("..").join("config").join("host.toml"),
        ];
        paths.into_iter().find(|path| path.exists())
    }

    /// load the first host.toml found, or the built-in house
    pub fn load_or_default() -> anyhow::Result<Self> {
        match Self::locate() {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.sensors.is_empty() {
            return Err(Error::Config("at least one sensor must be defined".into()));
        }
        if self.batching.max_batch_size == 0 {
            return Err(Error::Config("batching.max_batch_size must be positive".into()));
        }
        if self.batching.max_batch_age_ms == 0 {
            return Err(Error::Config("batching.max_batch_age_ms must be positive".into()));
        }

        let mut seen = HashSet::new();
        for sensor in &self.sensors {
            if !seen.insert(sensor.sensor_id.as_str()) {
                return Err(Error::Config(format!("duplicate sensor id {}", sensor.sensor_id)));
            }
            if sensor.min > sensor.max {
                return Err(Error::Config(format!(
                    "sensor {}: min {} exceeds max {}",
                    sensor.sensor_id, sensor.min, sensor.max
                )));
            }
            if self.intervals.for_sensor(sensor).is_zero() {
                return Err(Error::Config(format!("sensor {}: interval must be positive", sensor.sensor_id)));
            }
        }
        Ok(())
    }

    /// log the effective configuration
    pub fn log_summary(&self) {
        info!(
            bind = %format!("{}:{}", self.server.host, self.server.port),
            sensors = self.sensors.len(),
            storage = %self.storage.kind,
            max_batch_size = self.batching.max_batch_size,
            max_batch_age_ms = self.batching.max_batch_age_ms,
            max_retries = self.batching.max_retries,
            seed = ?self.simulation.seed,
            "host configuration"
        );
        for sensor in &self.sensors {
            info!(
                sensor = %sensor.sensor_id,
                room = %sensor.room_id,
                kind = %sensor.sensor_type,
                interval_secs = self.intervals.for_sensor(sensor).as_secs(),
                "sensor configured"
            );
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            batching: BatchingConfig::default(),
            intervals: IntervalsConfig::default(),
            broker: BrokerConfig::default(),
            storage: StorageConfig::default(),
            simulation: SimulationConfig::default(),
            sensors: default_sensors(),
        }
    }
}

// ==============================================================================
// default house
// ==============================================================================
// six rooms with temperature and humidity, energy meters for the five
// indoor rooms.

/// (room, base temp, daily swing, peak hour, inertia)
const TEMPERATURE_ROOMS: [(&str, f64, f64, f64, f64); 6] = [
    ("living_room", 22.0, 1.0, 18.0, 0.7),
    ("bedroom", 20.0, 2.0, 15.0, 0.8),
    ("kitchen", 23.0, 2.0, 18.0, 0.5),
    ("bathroom", 24.0, 3.0, 7.0, 0.6),
    ("basement", 18.0, 0.5, 15.0, 0.9),
    ("outdoor", 15.0, 5.0, 15.0, 0.3),
];

/// (room, base humidity, daily swing, peak hour)
const HUMIDITY_ROOMS: [(&str, f64, f64, f64); 6] = [
    ("living_room", 45.0, 5.0, 20.0),
    ("bedroom", 50.0, 5.0, 6.0),
    ("kitchen", 55.0, 10.0, 19.0),
    ("bathroom", 65.0, 15.0, 7.0),
    ("basement", 60.0, 3.0, 15.0),
    ("outdoor", 70.0, 15.0, 5.0),
];

/// (room, average draw in watts)
const ENERGY_ROOMS: [(&str, f64); 5] = [
    ("living_room", 400.0),
    ("bedroom", 150.0),
    ("kitchen", 800.0),
    ("bathroom", 300.0),
    ("basement", 250.0),
];

fn default_sensors() -> Vec<SensorDefinition> {
    let mut sensors = Vec::new();

    for (room, base, swing, peak, inertia) in TEMPERATURE_ROOMS {
        let outdoor = room == "outdoor";
        sensors.push(SensorDefinition {
            seasonal_amplitude: if outdoor { 8.0 } else { 2.4 },
            daily_amplitude: swing,
            daily_peak_hour: peak,
            noise: if outdoor { 0.8 } else { 0.3 },
            inertia,
            ..SensorDefinition::flat(format!("temp_{room}_001"), room, SensorType::Temperature, base, -30.0, 50.0)
        });
    }

    for (room, base, swing, peak) in HUMIDITY_ROOMS {
        sensors.push(SensorDefinition {
            seasonal_amplitude: -5.0,
            daily_amplitude: swing,
            daily_peak_hour: peak,
            noise: 1.5,
            inertia: 0.5,
            ..SensorDefinition::flat(format!("humid_{room}_001"), room, SensorType::Humidity, base, 20.0, 95.0)
        });
    }

    for (room, watts) in ENERGY_ROOMS {
        sensors.push(SensorDefinition {
            seasonal_amplitude: watts * 0.3,
            morning_amplitude: watts * 0.6,
            evening_amplitude: watts * 0.9,
            noise: watts * 0.1,
            ..SensorDefinition::flat(format!("energy_{room}_001"), room, SensorType::Energy, watts, 0.0, 10_000.0)
        });
    }

    sensors
}
