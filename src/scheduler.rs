//! ==============================================================================
//! scheduler.rs - ingestion scheduler
//! ==============================================================================
//!
//! purpose:
//!     runs every SensorSource on its own cadence and pushes each reading
//!     through the pipeline.
//!
//! architecture:
//!
//! ```text
//!     ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//!     │ source task  │  │ source task  │  │ source task  │   one per sensor,
//!     │ (interval a) │  │ (interval b) │  │ (interval c) │   own tokio interval
//!     └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!            └─────────────────┼─────────────────┘
//!                              ▼
//!                     Pipeline::dispatch
//!              registry -> writer -> broker
//!
//!     per-source state machine:
//!         Idle -> Scheduled -> Generating -> Dispatched -> Scheduled ...
//!         any state -> Stopped on shutdown
//! ```
//!
//! shutdown:
//!     stop() signals every task through a watch channel. a task finishes
//!     the tick it is in before it exits. tasks still running when the
//!     timeout expires are aborted and reported as a warning.
//!
//! ==============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::HostConfig;
use crate::domain::SensorType;
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineStats};
use crate::source::{SensorSource, Tick};

/// lifecycle of one source's task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Scheduled,
    Generating,
    Dispatched,
    Stopped,
}

/// per-source view for /api/status
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub sensor_id: String,
    pub room_id: String,
    pub sensor_type: SensorType,
    pub interval_ms: u64,
    pub state: SourceState,
    pub ticks: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub pipeline: PipelineStats,
    pub sources: Vec<SourceStatus>,
}

struct Slot {
    sensor_id: String,
    room_id: String,
    sensor_type: SensorType,
    interval: Duration,
    state: Mutex<SourceState>,
    ticks: AtomicU64,
    errors: AtomicU64,
}

impl Slot {
    fn set(&self, state: SourceState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn get(&self) -> SourceState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct IngestionScheduler {
    pipeline: Arc<Pipeline>,
    slots: Vec<Arc<Slot>>,
    pending: Mutex<Vec<SensorSource>>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
}

impl IngestionScheduler {
    pub fn new(sources: Vec<SensorSource>, pipeline: Arc<Pipeline>) -> Self {
        let slots = sources
            .iter()
            .map(|source| {
                let def = source.definition();
                Arc::new(Slot {
                    sensor_id: def.sensor_id.clone(),
                    room_id: def.room_id.clone(),
                    sensor_type: def.sensor_type,
                    interval: source.interval(),
                    state: Mutex::new(SourceState::Idle),
                    ticks: AtomicU64::new(0),
                    errors: AtomicU64::new(0),
                })
            })
            .collect();
        let (stop, _) = watch::channel(false);

        Self {
            pipeline,
            slots,
            pending: Mutex::new(sources),
            stop,
            tasks: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
        }
    }

    /// one source per configured sensor
    ///
    /// with `[simulation] seed` set, sensor `i` is seeded with `seed + i`
    /// so a run can be replayed.
    pub fn from_config(config: &HostConfig, pipeline: Arc<Pipeline>) -> Self {
        let sources = config
            .sensors
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let interval = config.intervals.for_sensor(def);
                match config.simulation.seed {
                    Some(seed) => SensorSource::with_seed(def.clone(), interval, seed.wrapping_add(i as u64)),
                    None => SensorSource::new(def.clone(), interval),
                }
            })
            .collect();
        Self::new(sources, pipeline)
    }

    /// spawn one task per source; calling it again does nothing
    pub fn start(&self) {
        let sources = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        if sources.is_empty() || *self.stop.borrow() {
            return;
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (source, slot) in sources.into_iter().zip(self.slots.iter()) {
            slot.set(SourceState::Scheduled);
            tasks.push(tokio::spawn(run_source(
                source,
                slot.clone(),
                self.pipeline.clone(),
                self.stop.subscribe(),
            )));
        }
        *self.started_at.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
        info!(sources = tasks.len(), "ingestion scheduler started");
    }

    /// cancel every timer and wait for in-flight ticks, up to `timeout`
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let _ = self.stop.send(true);
        let mut handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

        let outcome = match tokio::time::timeout(timeout, futures::future::join_all(handles.iter_mut())).await {
            Ok(_) => {
                info!("ingestion scheduler stopped");
                Ok(())
            }
            Err(_) => {
                let running = handles.iter().filter(|h| !h.is_finished()).count();
                warn!(running, timeout_ms = timeout.as_millis() as u64, "scheduler shutdown timed out, abandoning ticks");
                for handle in &handles {
                    handle.abort();
                }
                Err(Error::ShutdownTimeout(running))
            }
        };

        for slot in &self.slots {
            slot.set(SourceState::Stopped);
        }
        outcome
    }

    pub fn is_running(&self) -> bool {
        !*self.stop.borrow() && self.started_at.lock().map(|at| at.is_some()).unwrap_or(false)
    }

    pub fn sources(&self) -> Vec<SourceStatus> {
        self.slots
            .iter()
            .map(|slot| SourceStatus {
                sensor_id: slot.sensor_id.clone(),
                room_id: slot.room_id.clone(),
                sensor_type: slot.sensor_type,
                interval_ms: slot.interval.as_millis() as u64,
                state: slot.get(),
                ticks: slot.ticks.load(Ordering::Relaxed),
                errors: slot.errors.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let uptime = self
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0);
        SchedulerStats {
            running: self.is_running(),
            uptime_secs: uptime,
            pipeline: self.pipeline.stats(),
            sources: self.sources(),
        }
    }
}

// ==============================================================================
// per-source task
// ==============================================================================

async fn run_source(
    mut source: SensorSource,
    slot: Arc<Slot>,
    pipeline: Arc<Pipeline>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(source.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut index = 0u64;
    // tick times follow the runtime clock from a wall-clock anchor
    let anchor = (Utc::now(), Instant::now());

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop.borrow() {
            break;
        }

        slot.set(SourceState::Generating);
        let elapsed = chrono::Duration::from_std(anchor.1.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        let at: DateTime<Utc> = anchor.0 + elapsed;
        match source.generate(Tick::new(index, at)) {
            Ok(reading) => {
                pipeline.dispatch(reading);
                slot.set(SourceState::Dispatched);
            }
            Err(err) => {
                warn!(sensor = %slot.sensor_id, tick = index, error = %err, "generation failed, skipping tick");
                slot.errors.fetch_add(1, Ordering::Relaxed);
                pipeline.record_generation_error();
            }
        }
        slot.ticks.fetch_add(1, Ordering::Relaxed);
        index += 1;
        slot.set(SourceState::Scheduled);
    }

    slot.set(SourceState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchConfig, BatchWriter};
    use crate::broker::{Filter, SubscriptionBroker};
    use crate::domain::SensorDefinition;
    use crate::registry::ReadingRegistry;
    use crate::sink::MemorySink;

    fn pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            Arc::new(ReadingRegistry::new()),
            Arc::new(BatchWriter::start(BatchConfig::default(), Arc::new(MemorySink::new(1_000)))),
            Arc::new(SubscriptionBroker::new(64)),
            false,
        ))
    }

    fn source(id: &str, room: &str, kind: SensorType, every: u64) -> SensorSource {
        let def = SensorDefinition::flat(id, room, kind, 20.0, 0.0, 100.0);
        SensorSource::with_seed(def, Duration::from_secs(every), 7)
    }

    #[tokio::test(start_paused = true)]
    async fn sources_tick_on_independent_cadences() {
        let pipeline = pipeline();
        let scheduler = IngestionScheduler::new(
            vec![
                source("temp_kitchen_001", "kitchen", SensorType::Temperature, 1),
                source("humid_kitchen_001", "kitchen", SensorType::Humidity, 3),
            ],
            pipeline.clone(),
        );
        scheduler.start();

        // ticks at 0..=6 for the 1s source, 0, 3, 6 for the 3s one
        tokio::time::sleep(Duration::from_millis(6_500)).await;

        let stats = scheduler.stats();
        assert_eq!(stats.pipeline.readings_by_type[&SensorType::Temperature], 7);
        assert_eq!(stats.pipeline.readings_by_type[&SensorType::Humidity], 3);
        assert_eq!(stats.pipeline.total_readings, 10);
        assert!(stats.running);

        scheduler.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn generation_error_skips_tick_without_halting_others() {
        let pipeline = pipeline();
        let broken = SensorDefinition::flat("temp_attic_001", "attic", SensorType::Temperature, 20.0, 30.0, 10.0);
        let scheduler = IngestionScheduler::new(
            vec![
                SensorSource::with_seed(broken, Duration::from_secs(1), 1),
                source("energy_kitchen_001", "kitchen", SensorType::Energy, 1),
            ],
            pipeline.clone(),
        );
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let stats = scheduler.stats();
        assert_eq!(stats.pipeline.generation_errors, 3);
        assert_eq!(stats.pipeline.readings_by_type[&SensorType::Energy], 3);
        let attic = &stats.sources[0];
        assert_eq!((attic.ticks, attic.errors), (3, 3));
        assert!(pipeline.registry().get("attic", SensorType::Temperature).is_none());

        scheduler.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn each_tick_reaches_subscribers() {
        let pipeline = pipeline();
        let (_id, mut rx) = pipeline.broker().subscribe_channel(Filter::sensor(SensorType::Humidity), 16);
        let scheduler = IngestionScheduler::new(
            vec![
                source("temp_bedroom_001", "bedroom", SensorType::Temperature, 1),
                source("humid_bedroom_001", "bedroom", SensorType::Humidity, 2),
            ],
            pipeline.clone(),
        );
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(4_500)).await;
        scheduler.stop(Duration::from_secs(1)).await.unwrap();

        let mut received = 0;
        while let Ok(reading) = rx.try_recv() {
            assert_eq!(reading.sensor_type, SensorType::Humidity);
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_timers_and_marks_sources_stopped() {
        let pipeline = pipeline();
        let scheduler = IngestionScheduler::new(
            vec![source("temp_basement_001", "basement", SensorType::Temperature, 1)],
            pipeline.clone(),
        );
        assert_eq!(scheduler.sources()[0].state, SourceState::Idle);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        scheduler.stop(Duration::from_secs(1)).await.unwrap();
        let after_stop = pipeline.stats().total_readings;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(pipeline.stats().total_readings, after_stop);
        assert_eq!(scheduler.sources()[0].state, SourceState::Stopped);
        assert!(!scheduler.is_running());

        // second stop and a late start are no-ops
        scheduler.stop(Duration::from_secs(1)).await.unwrap();
        scheduler.start();
        assert_eq!(scheduler.sources()[0].state, SourceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn from_config_builds_one_source_per_sensor() {
        let config = HostConfig::default();
        let scheduler = IngestionScheduler::from_config(&config, pipeline());
        let sources = scheduler.sources();
        assert_eq!(sources.len(), config.sensors.len());
        let energy = sources.iter().find(|s| s.sensor_type == SensorType::Energy).unwrap();
        assert_eq!(energy.interval_ms, 60_000);
    }
}
