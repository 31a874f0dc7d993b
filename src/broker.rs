//! ==============================================================================
//! broker.rs - fan-out of readings to subscribers
//! ==============================================================================
//!
//! purpose:
//!     every dispatched reading is offered to every active subscription
//!     whose filter matches it. the transport layer (websocket handler)
//!     subscribes on connect and unsubscribes on disconnect; the broker
//!     never owns a socket, only the Deliver callback it was given.
//!
//! delivery model:
//!
//! ```text
//!     publish() ──try_send──► [queue A] ──► task A ──► deliver A (in order)
//!               ──try_send──► [queue B] ──► task B ──► deliver B (in order)
//!
//!     - publish is synchronous and never waits on a subscriber
//!     - each subscription has its own bounded queue and delivery task, so
//!       order is preserved per subscriber and a slow one only backs up
//!       its own queue (readings beyond capacity are dropped for it alone)
//!     - a failing deliver marks the subscription dead; it is removed on
//!       the next publish without any disconnect notification
//! ```
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{Reading, SensorType};
use crate::error::{Error, Result};

pub type SubscriptionId = Uuid;

/// which readings a subscription wants; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<SensorType>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn room(room_id: impl Into<String>) -> Self {
        Self {
            room_id: Some(room_id.into()),
            sensor_type: None,
        }
    }

    pub fn sensor(sensor_type: SensorType) -> Self {
        Self {
            room_id: None,
            sensor_type: Some(sensor_type),
        }
    }

    pub fn matches(&self, reading: &Reading) -> bool {
        self.room_id.as_deref().map_or(true, |room| room == reading.room_id)
            && self.sensor_type.map_or(true, |kind| kind == reading.sensor_type)
    }
}

/// where a subscription's readings go
#[async_trait]
pub trait Deliver: Send + Sync + 'static {
    async fn deliver(&self, reading: Arc<Reading>) -> Result<()>;
}

#[async_trait]
impl Deliver for mpsc::Sender<Arc<Reading>> {
    async fn deliver(&self, reading: Arc<Reading>) -> Result<()> {
        self.send(reading)
            .await
            .map_err(|_| Error::Delivery("receiver dropped".into()))
    }
}

/// adapter for plain closures
pub struct DeliverFn<F>(pub F);

#[async_trait]
impl<F> Deliver for DeliverFn<F>
where
    F: Fn(&Reading) -> Result<()> + Send + Sync + 'static,
{
    async fn deliver(&self, reading: Arc<Reading>) -> Result<()> {
        (self.0)(&reading)
    }
}

struct Subscriber {
    filter: Filter,
    queue: mpsc::Sender<Arc<Reading>>,
    dead: Arc<AtomicBool>,
    lagged: AtomicU64,
    task: JoinHandle<()>,
}

/// per-subscription view for /api/status
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub filter: Filter,
    /// readings dropped because this subscriber's queue was full
    pub lagged: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub subscribers: usize,
    pub published: u64,
    pub removed_dead: u64,
}

pub struct SubscriptionBroker {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    queue_capacity: usize,
    published: AtomicU64,
    removed_dead: AtomicU64,
}

impl SubscriptionBroker {
    /// `queue_capacity` bounds how far any one subscriber may fall behind
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            published: AtomicU64::new(0),
            removed_dead: AtomicU64::new(0),
        }
    }

    /// register interest; must run inside a tokio runtime
    pub fn subscribe<D: Deliver>(&self, filter: Filter, deliver: D) -> SubscriptionId {
        let id = Uuid::new_v4();
        let (queue, inbox) = mpsc::channel(self.queue_capacity);
        let dead = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_delivery(id, inbox, deliver, dead.clone()));

        debug!(subscription = %id, ?filter, "subscribed");
        let subscriber = Subscriber {
            filter,
            queue,
            dead,
            lagged: AtomicU64::new(0),
            task,
        };
        self.write_subscribers().insert(id, subscriber);
        id
    }

    /// convenience for callers that want a channel instead of a callback
    pub fn subscribe_channel(&self, filter: Filter, capacity: usize) -> (SubscriptionId, mpsc::Receiver<Arc<Reading>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (self.subscribe(filter, tx), rx)
    }

    /// remove a subscription; readings still queued for it are discarded
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.write_subscribers().remove(&id) {
            Some(subscriber) => {
                subscriber.task.abort();
                debug!(subscription = %id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// offer `reading` to every matching subscription
    ///
    /// returns how many subscriptions accepted it into their queue.
    pub fn publish(&self, reading: &Reading) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(reading.clone());
        let mut accepted = 0;
        let mut dead = Vec::new();

        {
            let subscribers = self.read_subscribers();
            for (id, subscriber) in subscribers.iter() {
                if subscriber.dead.load(Ordering::Acquire) {
                    dead.push(*id);
                    continue;
                }
                if !subscriber.filter.matches(&shared) {
                    continue;
                }
                match subscriber.queue.try_send(shared.clone()) {
                    Ok(()) => accepted += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let lagged = subscriber.lagged.fetch_add(1, Ordering::Relaxed) + 1;
                        if lagged.is_power_of_two() {
                            warn!(subscription = %id, lagged, "subscriber falling behind, dropping readings");
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            self.remove_dead(&dead);
        }
        accepted
    }

    fn remove_dead(&self, ids: &[SubscriptionId]) {
        let mut subscribers = self.write_subscribers();
        for id in ids {
            if let Some(subscriber) = subscribers.remove(id) {
                subscriber.task.abort();
                self.removed_dead.fetch_add(1, Ordering::Relaxed);
                info!(subscription = %id, "removed dead subscription");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.read_subscribers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.read_subscribers()
            .iter()
            .map(|(id, subscriber)| SubscriptionInfo {
                id: *id,
                filter: subscriber.filter.clone(),
                lagged: subscriber.lagged.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            subscribers: self.len(),
            published: self.published.load(Ordering::Relaxed),
            removed_dead: self.removed_dead.load(Ordering::Relaxed),
        }
    }

    /// drop every subscription
    pub fn close(&self) {
        let mut subscribers = self.write_subscribers();
        for (_, subscriber) in subscribers.drain() {
            subscriber.task.abort();
        }
    }

    fn read_subscribers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SubscriptionId, Subscriber>> {
        self.subscribers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_subscribers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SubscriptionId, Subscriber>> {
        self.subscribers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SubscriptionBroker {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_delivery<D: Deliver>(
    id: SubscriptionId,
    mut inbox: mpsc::Receiver<Arc<Reading>>,
    deliver: D,
    dead: Arc<AtomicBool>,
) {
    while let Some(reading) = inbox.recv().await {
        if let Err(err) = deliver.deliver(reading).await {
            warn!(subscription = %id, error = %err, "delivery failed, marking subscription dead");
            dead.store(true, Ordering::Release);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn reading(room: &str, kind: SensorType, value: f64) -> Reading {
        Reading {
            sensor_id: format!("{kind}_{room}"),
            room_id: room.into(),
            sensor_type: kind,
            value,
            unit: kind.unit().into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Arc<Reading>>) -> Option<Arc<Reading>> {
        timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
    }

    async fn nothing_more(rx: &mut mpsc::Receiver<Arc<Reading>>) {
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[test]
    fn filter_matching_is_a_logical_and() {
        let r = reading("kitchen", SensorType::Humidity, 50.0);
        assert!(Filter::all().matches(&r));
        assert!(Filter::room("kitchen").matches(&r));
        assert!(!Filter::room("bedroom").matches(&r));
        assert!(Filter::sensor(SensorType::Humidity).matches(&r));
        assert!(!Filter::sensor(SensorType::Energy).matches(&r));
        let both = Filter {
            room_id: Some("kitchen".into()),
            sensor_type: Some(SensorType::Temperature),
        };
        assert!(!both.matches(&r));
    }

    #[tokio::test]
    async fn room_filter_only_sees_its_room() {
        let broker = SubscriptionBroker::new(16);
        let (_, mut rx) = broker.subscribe_channel(Filter::room("kitchen"), 16);

        broker.publish(&reading("bedroom", SensorType::Temperature, 1.0));
        broker.publish(&reading("kitchen", SensorType::Temperature, 2.0));
        broker.publish(&reading("living_room", SensorType::Humidity, 3.0));
        broker.publish(&reading("kitchen", SensorType::Energy, 4.0));

        assert_eq!(next(&mut rx).await.unwrap().value, 2.0);
        assert_eq!(next(&mut rx).await.unwrap().value, 4.0);
        nothing_more(&mut rx).await;
    }

    #[tokio::test]
    async fn unfiltered_subscriber_gets_everything_in_order() {
        let broker = SubscriptionBroker::new(16);
        let (_, mut rx) = broker.subscribe_channel(Filter::all(), 16);

        let rooms = ["kitchen", "bedroom", "outdoor", "kitchen", "bedroom"];
        for (i, room) in rooms.iter().enumerate() {
            broker.publish(&reading(room, SensorType::Temperature, i as f64));
        }

        for i in 0..5 {
            assert_eq!(next(&mut rx).await.unwrap().value, i as f64);
        }
        nothing_more(&mut rx).await;
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_affect_others() {
        let broker = SubscriptionBroker::new(16);
        let mut healthy = Vec::new();
        for _ in 0..3 {
            healthy.push(broker.subscribe_channel(Filter::all(), 16).1);
        }
        broker.subscribe(
            Filter::all(),
            DeliverFn(|_: &Reading| -> Result<()> { Err(Error::Delivery("socket reset".into())) }),
        );
        assert_eq!(broker.len(), 4);

        for i in 0..3 {
            broker.publish(&reading("kitchen", SensorType::Temperature, i as f64));
            tokio::task::yield_now().await;
        }

        for rx in healthy.iter_mut() {
            for i in 0..3 {
                assert_eq!(next(rx).await.unwrap().value, i as f64);
            }
        }

        // give the failed task a moment to flag itself, then the next
        // publish sweeps it out
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish(&reading("kitchen", SensorType::Temperature, 9.0));
        assert_eq!(broker.len(), 3);
        assert_eq!(broker.stats().removed_dead, 1);
    }

    #[tokio::test]
    async fn slow_subscriber_never_blocks_publish() {
        struct Stuck;

        #[async_trait]
        impl Deliver for Stuck {
            async fn deliver(&self, _reading: Arc<Reading>) -> Result<()> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let broker = SubscriptionBroker::new(8);
        let stuck = broker.subscribe(Filter::all(), Stuck);
        let (_, mut rx) = broker.subscribe_channel(Filter::all(), 64);

        let published = timeout(Duration::from_secs(1), async {
            for i in 0..20 {
                broker.publish(&reading("kitchen", SensorType::Energy, i as f64));
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(published.is_ok());

        for i in 0..20 {
            assert_eq!(next(&mut rx).await.unwrap().value, i as f64);
        }
        let info = broker
            .subscriptions()
            .into_iter()
            .find(|s| s.id == stuck)
            .unwrap();
        assert!(info.lagged > 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_cleaned_up_lazily() {
        let broker = SubscriptionBroker::new(16);
        let (_, rx) = broker.subscribe_channel(Filter::all(), 1);
        drop(rx);

        broker.publish(&reading("kitchen", SensorType::Temperature, 1.0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish(&reading("kitchen", SensorType::Temperature, 2.0));
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = SubscriptionBroker::new(16);
        let (id, mut rx) = broker.subscribe_channel(Filter::sensor(SensorType::Humidity), 16);

        broker.publish(&reading("bathroom", SensorType::Humidity, 70.0));
        assert_eq!(next(&mut rx).await.unwrap().value, 70.0);

        assert!(broker.unsubscribe(id));
        assert!(!broker.unsubscribe(id));
        assert_eq!(broker.publish(&reading("bathroom", SensorType::Humidity, 71.0)), 0);
        assert!(next(&mut rx).await.is_none());
    }
}
