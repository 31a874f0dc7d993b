//! ==============================================================================
//! smarthome-telemetry - real-time telemetry ingestion and broadcast
//! ==============================================================================
//!
//! purpose:
//!     simulated smart home sensors feed a pipeline that keeps the latest
//!     value per room and sensor type, batches readings into a time-series
//!     store and pushes them live to websocket clients.
//!
//! data flow:
//!
//! ```text
//!     scheduler tick -> SensorSource::generate
//!                    -> ReadingRegistry::update
//!                    -> BatchWriter::enqueue  -> StorageSink::write_batch
//!                    -> SubscriptionBroker::publish -> websocket clients
//! ```
//!
//! ==============================================================================

pub mod batch;
pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod source;

pub use error::{Error, Result};
