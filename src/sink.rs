//! ==============================================================================
//! sink.rs - storage sinks for flushed batches
//! ==============================================================================
//!
//! purpose:
//!     the pipeline treats the time-series store as an append-only sink
//!     with a single bulk write. historical queries go to the store
//!     directly and never pass through here.
//!
//! implementations:
//!     - MemorySink: bounded in-process history, default and for tests
//!     - InfluxSink: InfluxDB 2.x line protocol over http (reqwest)
//!
//! ==============================================================================

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::domain::Reading;
use crate::error::{Error, Result};

/// bulk point writer used by the batch writer
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// short name for logs
    fn name(&self) -> &str;

    /// write every reading in `readings`, or fail as a whole
    async fn write_batch(&self, readings: &[Reading]) -> Result<()>;
}

pub type SinkPtr = Arc<dyn StorageSink>;

/// build the sink selected in [storage]
pub fn from_config(config: &StorageConfig) -> Result<SinkPtr> {
    match config.kind.as_str() {
        "memory" => Ok(Arc::new(MemorySink::new(config.memory_capacity))),
        "influxdb" => Ok(Arc::new(InfluxSink::new(config)?)),
        other => Err(Error::Config(format!("unknown storage kind: {other}"))),
    }
}

// ==============================================================================
// memory sink
// ==============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    points: VecDeque<Reading>,
    batch_sizes: VecDeque<usize>,
}

/// keeps the most recent `capacity` points, and the sizes of at most the
/// last `capacity` batches, in memory
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// retained points, oldest first
    pub fn points(&self) -> Vec<Reading> {
        match self.state.lock() {
            Ok(state) => state.points.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().points.iter().cloned().collect(),
        }
    }

    /// sizes of the most recent batches, in write order
    pub fn batch_sizes(&self) -> Vec<usize> {
        match self.state.lock() {
            Ok(state) => state.batch_sizes.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().batch_sizes.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write_batch(&self, readings: &[Reading]) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Storage("memory sink lock poisoned".into()))?;
        if state.batch_sizes.len() == self.capacity {
            state.batch_sizes.pop_front();
        }
        state.batch_sizes.push_back(readings.len());
        for reading in readings {
            if state.points.len() == self.capacity {
                state.points.pop_front();
            }
            state.points.push_back(reading.clone());
        }
        Ok(())
    }
}

// ==============================================================================
// influxdb sink
// ==============================================================================

/// writes batches to an InfluxDB 2.x bucket as line protocol
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxSink {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(Error::Config("storage.url is required for influxdb".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        let write_url = format!("{}/api/v2/write", config.url.trim_end_matches('/'));
        Ok(Self {
            client,
            write_url,
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        })
    }

    fn write_request(&self, body: String) -> reqwest::RequestBuilder {
        self.client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
    }
}

#[async_trait]
impl StorageSink for InfluxSink {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn write_batch(&self, readings: &[Reading]) -> Result<()> {
        let body = readings.iter().map(line_protocol).collect::<Vec<_>>().join("\n");

        let response = self.write_request(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Storage(format!("influxdb returned {status}: {detail}")));
        }
        Ok(())
    }
}

/// one line of influx line protocol for `reading`
///
/// measurement is the sensor type; room and sensor id are tags; numeric,
/// boolean and string metadata entries become extra fields.
pub fn line_protocol(reading: &Reading) -> String {
    let mut line = format!(
        "{},room_id={},sensor_id={} value={},unit=\"{}\"",
        reading.sensor_type,
        escape_tag(&reading.room_id),
        escape_tag(&reading.sensor_id),
        reading.value,
        escape_field(&reading.unit),
    );

    if let Some(serde_json::Value::Object(fields)) = &reading.metadata {
        for (key, value) in fields {
            let key = escape_tag(key);
            match value {
                serde_json::Value::Number(n) => {
                    let _ = write!(line, ",{key}={n}");
                }
                serde_json::Value::Bool(b) => {
                    let _ = write!(line, ",{key}={b}");
                }
                serde_json::Value::String(s) => {
                    let _ = write!(line, ",{key}=\"{}\"", escape_field(s));
                }
                _ => {}
            }
        }
    }

    let nanos = reading
        .timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| reading.timestamp.timestamp_millis() * 1_000_000);
    let _ = write!(line, " {nanos}");
    line
}

fn escape_tag(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_field(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
