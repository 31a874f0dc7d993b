//! ==============================================================================
//! logging.rs - tracing subscriber setup
//! ==============================================================================
//!
//! purpose:
//!     installs the global tracing subscriber from the [logging] section.
//!     RUST_LOG, when set, replaces the configured level filter.
//!
//! ==============================================================================

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// multi-line with colors, for development
    Pretty,
    /// one line per event without colors
    Compact,
    /// newline-delimited json for log aggregation
    Json,
}

impl OutputFormat {
    pub fn parse(format: &str) -> Result<Self> {
        match format.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!(
                "invalid log format '{other}', expected pretty, compact or json"
            ))),
        }
    }
}

/// Initialize the global subscriber.
///
/// Calling it again after a subscriber is installed is a no-op, so tests
/// and embedding applications can call it freely.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level = parse_log_level(&config.level)?;
    let format = OutputFormat::parse(&config.format)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let layer = match format {
        OutputFormat::Pretty => fmt::layer().pretty().with_target(true).with_filter(env_filter).boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer().json().with_filter(env_filter).boxed(),
    };

    // already initialised is fine
    let _ = tracing_subscriber::registry().with(layer).try_init();
    Ok(())
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(Error::Config(format!(
            "invalid log level '{level}', expected trace, debug, info, warn or error"
        ))),
    }
}
