//! ==============================================================================
//! batch.rs - buffered storage writes
//! ==============================================================================
//!
//! purpose:
//!     decouples the ingestion rate from storage write throughput. readings
//!     are appended to an open batch; a batch is handed to the flusher when
//!     it reaches max_batch_size or when max_batch_age has passed since its
//!     first reading, whichever happens first.
//!
//! architecture:
//!
//! ```text
//!     enqueue() ──► [open batch] ──full──► queue ──► flusher task ──► sink
//!                        ▲                  ▲             │
//!                        │                  │             ├─► Flushed event
//!     age ticker ────────┴──── aged ────────┘             └─► Dropped event
//!
//!     - enqueue never awaits: a full batch is swapped out for an empty one
//!       and pushed onto a bounded queue with try_send (double buffering).
//!     - one periodic ticker checks the age of the open batch, there are no
//!       per-reading timers.
//!     - the flusher retries a failed batch with backoff, then drops it and
//!       emits a Dropped event. telemetry is best-effort durable.
//!     - if the queue itself is full (sink stalled for a long time) the new
//!       batch is dropped with an Overflow event so memory stays bounded.
//! ```
//!
//! relationships:
//!     - fed by: pipeline.rs
//!     - writes to: sink.rs (StorageSink)
//!     - uses: retry.rs
//!
//! ==============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::Reading;
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::sink::SinkPtr;

/// tunables for a BatchWriter
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_batch_age: Duration,
    /// how often the age ticker looks at the open batch
    pub check_interval: Duration,
    /// batches that may wait for the sink before new ones are dropped
    pub queue_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_age: Duration::from_secs(5),
            check_interval: Duration::from_millis(250),
            queue_capacity: 64,
            retry: RetryConfig::default(),
        }
    }
}

/// observable outcome of each batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WriterEvent {
    /// the sink accepted the batch
    Flushed { len: usize, attempts: u32 },
    /// every attempt failed and the batch was discarded; `attempts` is 0
    /// when the flusher had already stopped
    Dropped { len: usize, attempts: u32, error: String },
    /// the flush queue was full and the batch never reached the sink
    Overflow { len: usize },
}

/// running totals for /api/status
#[derive(Debug, Clone, Default, Serialize)]
pub struct WriterStats {
    pub pending: usize,
    pub flushed_batches: u64,
    pub flushed_points: u64,
    pub dropped_batches: u64,
    pub dropped_points: u64,
}

enum Command {
    Write(Vec<Reading>),
    Sync(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct OpenBatch {
    readings: Vec<Reading>,
    opened_at: Option<Instant>,
}

impl OpenBatch {
    fn take(&mut self, capacity: usize) -> Vec<Reading> {
        self.opened_at = None;
        std::mem::replace(&mut self.readings, Vec::with_capacity(capacity))
    }
}

#[derive(Default)]
struct Counters {
    flushed_batches: AtomicU64,
    flushed_points: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_points: AtomicU64,
}

/// state shared between the writer handle, the age ticker and the flusher
struct Shared {
    config: BatchConfig,
    open: Mutex<OpenBatch>,
    closed: AtomicBool,
    queue: mpsc::Sender<Command>,
    events: broadcast::Sender<WriterEvent>,
    counters: Counters,
}

impl Shared {
    fn lock_open(&self) -> MutexGuard<'_, OpenBatch> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// hand a batch to the flusher without waiting
    fn submit(&self, batch: Vec<Reading>) {
        if batch.is_empty() {
            return;
        }
        let len = batch.len();
        match self.queue.try_send(Command::Write(batch)) {
            Ok(()) => debug!(batch_len = len, "batch queued for flush"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!(batch_len = len, "flush queue full, dropping batch");
                self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped_points.fetch_add(len as u64, Ordering::Relaxed);
                let _ = self.events.send(WriterEvent::Overflow { len });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(batch_len = len, "flusher stopped, batch discarded");
                self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped_points.fetch_add(len as u64, Ordering::Relaxed);
                let _ = self.events.send(WriterEvent::Dropped {
                    len,
                    attempts: 0,
                    error: Error::WriterClosed.to_string(),
                });
            }
        }
    }

    /// take the open batch if it is older than max_batch_age
    fn take_if_aged(&self) -> Option<Vec<Reading>> {
        let mut open = self.lock_open();
        match open.opened_at {
            Some(opened) if opened.elapsed() >= self.config.max_batch_age && !open.readings.is_empty() => {
                Some(open.take(self.config.max_batch_size))
            }
            _ => None,
        }
    }
}

/// accumulates readings and flushes them to a storage sink
pub struct BatchWriter {
    shared: Arc<Shared>,
    stop_ticker: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchWriter {
    /// spawn the age ticker and the flusher; must run inside a tokio runtime
    pub fn start(config: BatchConfig, sink: SinkPtr) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (events, _) = broadcast::channel(64);
        let (stop_ticker, stop_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            open: Mutex::new(OpenBatch {
                readings: Vec::with_capacity(config.max_batch_size),
                opened_at: None,
            }),
            config,
            closed: AtomicBool::new(false),
            queue: queue_tx,
            events,
            counters: Counters::default(),
        });

        let ticker = tokio::spawn(run_age_ticker(shared.clone(), stop_rx));
        let flusher = tokio::spawn(run_flusher(shared.clone(), sink, queue_rx));

        Self {
            shared,
            stop_ticker,
            tasks: Mutex::new(vec![ticker, flusher]),
        }
    }

    /// append a reading to the open batch
    ///
    /// never awaits. fails only once the writer has been closed.
    pub fn enqueue(&self, reading: Reading) -> Result<()> {
        let full = {
            let mut open = self.shared.lock_open();
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(Error::WriterClosed);
            }
            if open.readings.is_empty() {
                open.opened_at = Some(Instant::now());
            }
            open.readings.push(reading);
            if open.readings.len() >= self.shared.config.max_batch_size {
                Some(open.take(self.shared.config.max_batch_size))
            } else {
                None
            }
        };

        if let Some(batch) = full {
            self.shared.submit(batch);
        }
        Ok(())
    }

    /// flush the open batch now and wait until every queued batch has been
    /// written or dropped
    pub async fn flush(&self) {
        let batch = self.shared.lock_open().take(self.shared.config.max_batch_size);
        if !batch.is_empty() {
            let _ = self.shared.queue.send(Command::Write(batch)).await;
        }
        self.sync().await;
    }

    /// wait for batches already queued, leaving the open batch alone
    pub async fn sync(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.shared.queue.send(Command::Sync(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// stop accepting readings, flush what is left and wait for the flusher
    ///
    /// writes still running when `timeout` expires are abandoned.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.stop_ticker.send(true);

        let remaining = self.shared.lock_open().take(0);
        if !remaining.is_empty() {
            info!(batch_len = remaining.len(), "flushing final batch");
            let _ = self.shared.queue.send(Command::Write(remaining)).await;
        }
        let _ = self.shared.queue.send(Command::Shutdown).await;

        let mut handles = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *tasks)
        };

        let drained = tokio::time::timeout(timeout, futures::future::join_all(handles.iter_mut())).await;
        match drained {
            Ok(_) => Ok(()),
            Err(_) => {
                let running = handles.iter().filter(|h| !h.is_finished()).count();
                warn!(running, "batch writer did not drain in time, abandoning writes");
                for handle in &handles {
                    handle.abort();
                }
                Err(Error::ShutdownTimeout(running))
            }
        }
    }

    /// subscribe to flush outcomes
    pub fn events(&self) -> broadcast::Receiver<WriterEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WriterStats {
        let counters = &self.shared.counters;
        WriterStats {
            pending: self.shared.lock_open().readings.len(),
            flushed_batches: counters.flushed_batches.load(Ordering::Relaxed),
            flushed_points: counters.flushed_points.load(Ordering::Relaxed),
            dropped_batches: counters.dropped_batches.load(Ordering::Relaxed),
            dropped_points: counters.dropped_points.load(Ordering::Relaxed),
        }
    }
}

async fn run_age_ticker(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut ticks = interval(shared.config.check_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if let Some(batch) = shared.take_if_aged() {
                    debug!(batch_len = batch.len(), "batch reached max age");
                    shared.submit(batch);
                }
            }
            _ = stop.changed() => break,
        }
    }
}

async fn run_flusher(shared: Arc<Shared>, sink: SinkPtr, mut queue: mpsc::Receiver<Command>) {
    while let Some(command) = queue.recv().await {
        match command {
            Command::Write(batch) => write_batch(&shared, &sink, batch).await,
            Command::Sync(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown => {
                // batches submitted while close() ran may sit behind the
                // marker; stop new sends and drain what is already queued
                queue.close();
            }
        }
    }
    debug!(sink = sink.name(), "flusher stopped");
}

async fn write_batch(shared: &Shared, sink: &SinkPtr, batch: Vec<Reading>) {
    let len = batch.len();
    let points = batch.as_slice();
    let target = sink.as_ref();
    let outcome = retry_with_backoff(&shared.config.retry, move || target.write_batch(points)).await;
    let counters = &shared.counters;

    let event = match outcome.result {
        Ok(()) => {
            debug!(sink = sink.name(), batch_len = len, attempts = outcome.attempts, "batch written");
            counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
            counters.flushed_points.fetch_add(len as u64, Ordering::Relaxed);
            WriterEvent::Flushed { len, attempts: outcome.attempts }
        }
        Err(err) => {
            error!(
                sink = sink.name(),
                batch_len = len,
                attempts = outcome.attempts,
                error = %err,
                "batch dropped after retries"
            );
            counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
            counters.dropped_points.fetch_add(len as u64, Ordering::Relaxed);
            WriterEvent::Dropped {
                len,
                attempts: outcome.attempts,
                error: err.to_string(),
            }
        }
    };
    let _ = shared.events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SensorType;
    use crate::sink::{MemorySink, StorageSink};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    fn reading(i: usize) -> Reading {
        Reading {
            sensor_id: format!("temp_{i}"),
            room_id: "kitchen".into(),
            sensor_type: SensorType::Temperature,
            value: i as f64,
            unit: "°C".into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    fn config(max_batch_size: usize) -> BatchConfig {
        BatchConfig {
            max_batch_size,
            max_batch_age: Duration::from_secs(1),
            check_interval: Duration::from_millis(100),
            queue_capacity: 8,
            retry: RetryConfig {
                max_attempts: 3,
                multiplier: 2.0,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
            },
        }
    }

    /// fails the first `failures` writes, then delegates to a MemorySink
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
        inner: MemorySink,
    }

    impl FlakySink {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                inner: MemorySink::new(1000),
            }
        }
    }

    #[async_trait]
    impl StorageSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn write_batch(&self, readings: &[Reading]) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::Storage(format!("unavailable (call {call})")));
            }
            self.inner.write_batch(readings).await
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn age_flush_sends_partial_batch_once() {
        let sink = Arc::new(MemorySink::new(100));
        let writer = BatchWriter::start(config(5), sink.clone());
        let mut events = writer.events();

        for i in 0..3 {
            writer.enqueue(reading(i)).unwrap();
        }

        tokio::time::advance(Duration::from_millis(900)).await;
        settle().await;
        assert!(sink.batch_sizes().is_empty(), "flushed before max age");

        tokio::time::advance(Duration::from_millis(200)).await;
        let event = events.recv().await.unwrap();
        assert_eq!(event, WriterEvent::Flushed { len: 3, attempts: 1 });
        assert_eq!(sink.batch_sizes(), [3]);

        // nothing left to flush however long we wait
        tokio::time::advance(Duration::from_secs(5)).await;
        writer.sync().await;
        assert_eq!(sink.batch_sizes(), [3]);
    }

    #[tokio::test(start_paused = true)]
    async fn size_flush_happens_without_waiting_for_age() {
        let sink = Arc::new(MemorySink::new(100));
        let writer = BatchWriter::start(config(5), sink.clone());
        let mut events = writer.events();

        for i in 0..12 {
            writer.enqueue(reading(i)).unwrap();
        }
        assert_eq!(events.recv().await.unwrap(), WriterEvent::Flushed { len: 5, attempts: 1 });
        assert_eq!(events.recv().await.unwrap(), WriterEvent::Flushed { len: 5, attempts: 1 });
        assert_eq!(writer.stats().pending, 2);

        // the remainder goes out on age
        assert_eq!(events.recv().await.unwrap(), WriterEvent::Flushed { len: 2, attempts: 1 });
        assert_eq!(sink.batch_sizes(), [5, 5, 2]);

        let values: Vec<f64> = sink.points().iter().map(|r| r.value).collect();
        assert_eq!(values, (0..12).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sink_drops_batch_once_and_ingestion_continues() {
        let sink = Arc::new(FlakySink::new(3));
        let writer = BatchWriter::start(config(2), sink.clone());
        let mut events = writer.events();

        writer.enqueue(reading(0)).unwrap();
        writer.enqueue(reading(1)).unwrap();

        match events.recv().await.unwrap() {
            WriterEvent::Dropped { len, attempts, .. } => {
                assert_eq!(len, 2);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected drop, got {other:?}"),
        }
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);

        // the sink is back; new readings flow as usual
        writer.enqueue(reading(2)).unwrap();
        writer.enqueue(reading(3)).unwrap();
        assert_eq!(events.recv().await.unwrap(), WriterEvent::Flushed { len: 2, attempts: 1 });
        assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

        let stats = writer.stats();
        assert_eq!(stats.dropped_batches, 1);
        assert_eq!(stats.flushed_points, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_batch_is_written_intact() {
        let sink = Arc::new(FlakySink::new(2));
        let writer = BatchWriter::start(config(3), sink.clone());
        let mut events = writer.events();

        for i in 0..3 {
            writer.enqueue(reading(i)).unwrap();
        }
        assert_eq!(events.recv().await.unwrap(), WriterEvent::Flushed { len: 3, attempts: 3 });
        assert_eq!(sink.inner.batch_sizes(), [3]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_remainder_and_rejects_new_readings() {
        let sink = Arc::new(MemorySink::new(100));
        let writer = BatchWriter::start(config(10), sink.clone());

        writer.enqueue(reading(0)).unwrap();
        writer.enqueue(reading(1)).unwrap();
        writer.close(Duration::from_secs(1)).await.unwrap();

        assert_eq!(sink.batch_sizes(), [2]);
        assert!(writer.is_closed());
        assert!(matches!(writer.enqueue(reading(2)), Err(Error::WriterClosed)));
        // second close is a no-op
        writer.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn batch_queued_behind_shutdown_is_still_written() {
        let sink = Arc::new(MemorySink::new(100));
        let writer = BatchWriter::start(config(2), sink.clone());
        let mut events = writer.events();

        // a full batch taken by enqueue just before close lands after the marker
        writer.shared.queue.send(Command::Shutdown).await.unwrap();
        writer.shared.submit(vec![reading(0), reading(1)]);

        assert_eq!(events.recv().await.unwrap(), WriterEvent::Flushed { len: 2, attempts: 1 });
        assert_eq!(sink.batch_sizes(), [2]);
        writer.close(Duration::from_secs(1)).await.unwrap();
        assert_eq!(writer.stats().flushed_points, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_submitted_after_flusher_exit_is_counted_as_dropped() {
        let writer = BatchWriter::start(config(2), Arc::new(MemorySink::new(100)));
        let mut events = writer.events();
        writer.close(Duration::from_secs(1)).await.unwrap();

        writer.shared.submit(vec![reading(0), reading(1)]);

        assert_eq!(
            events.recv().await.unwrap(),
            WriterEvent::Dropped {
                len: 2,
                attempts: 0,
                error: "batch writer is closed".into(),
            }
        );
        let stats = writer.stats();
        assert_eq!((stats.dropped_batches, stats.dropped_points), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_writes_open_batch() {
        let sink = Arc::new(MemorySink::new(100));
        let writer = BatchWriter::start(config(10), sink.clone());

        writer.enqueue(reading(0)).unwrap();
        writer.flush().await;
        assert_eq!(sink.batch_sizes(), [1]);
        writer.flush().await;
        assert_eq!(sink.batch_sizes(), [1]);
    }
}
