//! ==============================================================================
//! pipeline.rs - per-reading dispatch
//! ==============================================================================
//!
//! purpose:
//!     every generated reading goes to three places, in this order:
//!         1. ReadingRegistry.update   (latest-value snapshot)
//!         2. BatchWriter.enqueue      (storage)
//!         3. SubscriptionBroker.publish (live clients)
//!
//! ```text
//!     the three are independent side effects. a closed writer or a
//!     registry conflict never keeps the reading from the others.
//! ```
//!
//! relationships:
//!     - used by: scheduler.rs (one dispatch per tick)
//!     - read by: server.rs (/api/status counters)
//!
//! ==============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::batch::BatchWriter;
use crate::broker::SubscriptionBroker;
use crate::domain::{Reading, SensorType};
use crate::registry::ReadingRegistry;

/// what happened to one dispatched reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// the registry accepted it as the newest reading for its key
    pub registry_updated: bool,
    /// the batch writer took it
    pub enqueued: bool,
    /// number of subscriptions it was queued for
    pub delivered: usize,
}

/// dispatch counters shown on /api/status
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub total_readings: u64,
    pub readings_by_type: BTreeMap<SensorType, u64>,
    pub generation_errors: u64,
    pub last_reading_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    // indexed like SensorType::ALL
    by_type: [AtomicU64; 3],
    generation_errors: AtomicU64,
    last_reading_at: Mutex<Option<DateTime<Utc>>>,
}

pub struct Pipeline {
    registry: Arc<ReadingRegistry>,
    writer: Arc<BatchWriter>,
    broker: Arc<SubscriptionBroker>,
    show_sensor_data: bool,
    counters: Counters,
}

impl Pipeline {
    pub fn new(
        registry: Arc<ReadingRegistry>,
        writer: Arc<BatchWriter>,
        broker: Arc<SubscriptionBroker>,
        show_sensor_data: bool,
    ) -> Self {
        Self {
            registry,
            writer,
            broker,
            show_sensor_data,
            counters: Counters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ReadingRegistry> {
        &self.registry
    }

    pub fn writer(&self) -> &Arc<BatchWriter> {
        &self.writer
    }

    pub fn broker(&self) -> &Arc<SubscriptionBroker> {
        &self.broker
    }

    /// push one reading through registry, writer and broker
    pub fn dispatch(&self, reading: Reading) -> Dispatch {
        if self.show_sensor_data {
            debug!(
                sensor = %reading.sensor_id,
                room = %reading.room_id,
                value = reading.value,
                unit = %reading.unit,
                "reading"
            );
        }
        self.record(&reading);

        let registry_updated = self.registry.update(reading.clone());
        if !registry_updated {
            debug!(sensor = %reading.sensor_id, at = %reading.timestamp, "stale reading ignored by registry");
        }

        let enqueued = match self.writer.enqueue(reading.clone()) {
            Ok(()) => true,
            Err(err) => {
                warn!(sensor = %reading.sensor_id, error = %err, "reading not queued for storage");
                false
            }
        };

        let delivered = self.broker.publish(&reading);

        Dispatch {
            registry_updated,
            enqueued,
            delivered,
        }
    }

    pub fn record_generation_error(&self) {
        self.counters.generation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.counters;
        let readings_by_type = SensorType::ALL
            .iter()
            .zip(counters.by_type.iter())
            .map(|(kind, count)| (*kind, count.load(Ordering::Relaxed)))
            .collect();
        PipelineStats {
            total_readings: counters.total.load(Ordering::Relaxed),
            readings_by_type,
            generation_errors: counters.generation_errors.load(Ordering::Relaxed),
            last_reading_at: *counters
                .last_reading_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    fn record(&self, reading: &Reading) {
        let counters = &self.counters;
        counters.total.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = SensorType::ALL.iter().position(|kind| *kind == reading.sensor_type) {
            counters.by_type[slot].fetch_add(1, Ordering::Relaxed);
        }
        let mut last = counters
            .last_reading_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.map_or(true, |at| reading.timestamp > at) {
            *last = Some(reading.timestamp);
        }
    }
}
