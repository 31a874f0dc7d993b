//! ==============================================================================
//! registry.rs - latest-value store
//! ==============================================================================
//!
//! purpose:
//!     keeps the most recent reading per (room, sensor type) and answers
//!     "latest" queries from the api without touching storage.
//!
//! concurrency:
//!     backed by a sharded DashMap. an update locks only the shard that owns
//!     its key, compares timestamps and replaces the whole Reading in one
//!     step, so unrelated keys never contend and readers never see a half
//!     written snapshot.
//!
//! relationships:
//!     - written by: pipeline.rs (every dispatched reading)
//!     - read by: server.rs (rest handlers)
//!
//! ==============================================================================

use std::collections::BTreeMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use crate::domain::{Reading, SensorKey, SensorType};

/// result of a latest-reading lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Latest {
    /// both room and sensor type were given
    Single(Option<Reading>),
    /// partial or no filter; sorted by (room, sensor type)
    Many(Vec<Reading>),
}

/// on-demand summary across rooms for one sensor type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub sensor_type: SensorType,
    pub count: usize,
    /// total across rooms (total power for energy)
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Default)]
pub struct ReadingRegistry {
    latest: DashMap<SensorKey, Reading>,
}

impl ReadingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// store `reading` unless a newer one is already held for its key
    ///
    /// returns whether the reading was applied. equal timestamps replace
    /// (last writer wins); older timestamps are ignored.
    pub fn update(&self, reading: Reading) -> bool {
        match self.latest.entry(reading.key()) {
            Entry::Occupied(mut slot) => {
                if reading.timestamp >= slot.get().timestamp {
                    slot.insert(reading);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(reading);
                true
            }
        }
    }

    /// latest reading for exactly one key
    pub fn get(&self, room_id: &str, sensor_type: SensorType) -> Option<Reading> {
        self.latest
            .get(&SensorKey::new(room_id, sensor_type))
            .map(|entry| entry.value().clone())
    }

    /// latest readings, optionally narrowed by room and/or sensor type
    pub fn get_latest(&self, room_id: Option<&str>, sensor_type: Option<SensorType>) -> Latest {
        if let (Some(room), Some(kind)) = (room_id, sensor_type) {
            return Latest::Single(self.get(room, kind));
        }

        let mut readings: Vec<Reading> = self
            .latest
            .iter()
            .filter(|entry| room_id.map_or(true, |room| entry.key().room_id == room))
            .filter(|entry| sensor_type.map_or(true, |kind| entry.key().sensor_type == kind))
            .map(|entry| entry.value().clone())
            .collect();
        readings.sort_by(|a, b| a.key().cmp(&b.key()));
        Latest::Many(readings)
    }

    /// every latest reading for one room, keyed by sensor type
    pub fn room_summary(&self, room_id: &str) -> BTreeMap<SensorType, Reading> {
        self.latest
            .iter()
            .filter(|entry| entry.key().room_id == room_id)
            .map(|entry| (entry.key().sensor_type, entry.value().clone()))
            .collect()
    }

    /// computed from the current snapshot each call, never cached
    pub fn aggregate(&self, sensor_type: SensorType) -> Option<Aggregate> {
        let values: Vec<f64> = self
            .latest
            .iter()
            .filter(|entry| entry.key().sensor_type == sensor_type)
            .map(|entry| entry.value().value)
            .collect();

        if values.is_empty() {
            return None;
        }

        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Some(Aggregate {
            sensor_type,
            count: values.len(),
            sum,
            mean: sum / values.len() as f64,
            min,
            max,
        })
    }

    /// sorted list of rooms with at least one reading
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.latest.iter().map(|entry| entry.key().room_id.clone()).collect();
        rooms.sort();
        rooms.dedup();
        rooms
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    /// true until the first reading arrives; the api reports "no data"
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn reading(room: &str, kind: SensorType, value: f64, at: DateTime<Utc>) -> Reading {
        Reading {
            sensor_id: format!("{kind}_{room}_001"),
            room_id: room.to_string(),
            sensor_type: kind,
            value,
            unit: kind.unit().to_string(),
            timestamp: at,
            metadata: None,
        }
    }

    #[test]
    fn out_of_order_update_does_not_regress() {
        let registry = ReadingRegistry::new();
        assert!(registry.update(reading("living_room", SensorType::Temperature, 22.0, t(20))));
        assert!(!registry.update(reading("living_room", SensorType::Temperature, 19.0, t(10))));

        let stored = registry.get("living_room", SensorType::Temperature).unwrap();
        assert_eq!(stored.timestamp, t(20));
        assert_eq!(stored.value, 22.0);
    }

    #[test]
    fn equal_timestamp_replaces() {
        let registry = ReadingRegistry::new();
        registry.update(reading("kitchen", SensorType::Humidity, 40.0, t(5)));
        assert!(registry.update(reading("kitchen", SensorType::Humidity, 41.0, t(5))));
        assert_eq!(registry.get("kitchen", SensorType::Humidity).unwrap().value, 41.0);
    }

    #[test]
    fn keeps_max_timestamp_for_interleaved_updates() {
        let registry = ReadingRegistry::new();
        let offsets = [5, 3, 9, 1, 9, 7, 12, 2, 11];
        let mut max_seen = i64::MIN;
        for (i, offset) in offsets.iter().enumerate() {
            registry.update(reading("bedroom", SensorType::Temperature, i as f64, t(*offset)));
            max_seen = max_seen.max(*offset);
            let stored = registry.get("bedroom", SensorType::Temperature).unwrap();
            assert_eq!(stored.timestamp, t(max_seen));
        }
    }

    #[test]
    fn get_latest_filters() {
        let registry = ReadingRegistry::new();
        registry.update(reading("kitchen", SensorType::Temperature, 23.0, t(1)));
        registry.update(reading("kitchen", SensorType::Humidity, 50.0, t(1)));
        registry.update(reading("bedroom", SensorType::Temperature, 20.0, t(1)));

        match registry.get_latest(Some("kitchen"), Some(SensorType::Humidity)) {
            Latest::Single(Some(r)) => assert_eq!(r.value, 50.0),
            other => panic!("unexpected {other:?}"),
        }
        match registry.get_latest(Some("kitchen"), None) {
            Latest::Many(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        match registry.get_latest(None, Some(SensorType::Temperature)) {
            Latest::Many(list) => {
                let rooms: Vec<_> = list.iter().map(|r| r.room_id.as_str()).collect();
                assert_eq!(rooms, ["bedroom", "kitchen"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(registry.get_latest(Some("garage"), Some(SensorType::Energy)), Latest::Single(None));
    }

    #[test]
    fn aggregate_is_computed_from_current_values() {
        let registry = ReadingRegistry::new();
        assert!(registry.aggregate(SensorType::Energy).is_none());

        registry.update(reading("kitchen", SensorType::Energy, 1200.0, t(1)));
        registry.update(reading("living_room", SensorType::Energy, 300.0, t(1)));
        let agg = registry.aggregate(SensorType::Energy).unwrap();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.sum, 1500.0);
        assert_eq!(agg.mean, 750.0);
        assert_eq!(agg.min, 300.0);
        assert_eq!(agg.max, 1200.0);

        registry.update(reading("kitchen", SensorType::Energy, 200.0, t(2)));
        assert_eq!(registry.aggregate(SensorType::Energy).unwrap().sum, 500.0);
    }

    #[test]
    fn room_summary_and_rooms() {
        let registry = ReadingRegistry::new();
        assert!(registry.is_empty());
        registry.update(reading("bathroom", SensorType::Temperature, 24.0, t(1)));
        registry.update(reading("bathroom", SensorType::Humidity, 70.0, t(1)));
        registry.update(reading("basement", SensorType::Humidity, 60.0, t(1)));

        let summary = registry.room_summary("bathroom");
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[&SensorType::Humidity].value, 70.0);
        assert_eq!(registry.rooms(), ["basement", "bathroom"]);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_converge_on_newest() {
        let registry = Arc::new(ReadingRegistry::new());
        let base = t(0);
        let mut handles = Vec::new();
        for worker in 0..8i64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..200i64 {
                    let at = base + Duration::seconds((i * 8 + worker) % 1000);
                    registry.update(reading("outdoor", SensorType::Temperature, i as f64, at));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let stored = registry.get("outdoor", SensorType::Temperature).unwrap();
        assert_eq!(stored.timestamp, base + Duration::seconds(999));
    }
}
