use thiserror::Error;

/// Errors raised inside the telemetry pipeline.
///
/// None of these cross a component boundary upward: the scheduler logs
/// generation errors, the batch writer turns storage errors into events
/// and the broker drops subscribers whose delivery fails.
#[derive(Error, Debug)]
pub enum Error {
    /// A sensor source produced a value that cannot be published
    #[error("generation failed for sensor {sensor_id}: {reason}")]
    Generation { sensor_id: String, reason: String },

    /// The storage sink rejected a batch write
    #[error("storage write failed: {0}")]
    Storage(String),

    /// A subscriber could not accept a reading
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The batch writer has been closed and accepts no more readings
    #[error("batch writer is closed")]
    WriterClosed,

    /// Graceful shutdown did not finish in time
    #[error("shutdown timed out with {0} task(s) still running")]
    ShutdownTimeout(usize),

    /// Sensor type string did not name a known kind
    #[error("unknown sensor type: {0}")]
    UnknownSensorType(String),

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// HTTP client error talking to the storage backend
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;
