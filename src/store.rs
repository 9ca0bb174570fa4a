//! In-memory sensor store: time-indexed readings, read-only after ingestion.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use crate::domain::{Reading, Sensor, TimeRange};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown sensor: {0}")]
    UnknownSensor(String),
    #[error("reading batch contains sensor id {got}, expected {expected}")]
    MixedBatch { expected: String, got: String },
}

#[derive(Default)]
struct StoreInner {
    sensors: Vec<Sensor>,
    /// Per-sensor readings kept sorted by timestamp.
    readings: HashMap<String, Vec<Reading>>,
}

/// Time-indexed collection of readings per sensor.
///
/// Ingestion happens once, before the engine starts; afterwards the store is
/// only read, concurrently, from the engine tick and from embedder queries.
/// Range queries are O(log n + k) via binary search on the sorted per-sensor
/// vectors.
#[derive(Default)]
pub struct SensorStore {
    inner: RwLock<StoreInner>,
}

impl SensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sensor(&self, sensor: Sensor) {
        let mut inner = self.inner.write();
        if !inner.sensors.iter().any(|s| s.id == sensor.id) {
            inner.readings.entry(sensor.id.clone()).or_default();
            inner.sensors.push(sensor);
        }
    }

    /// Insert a batch of readings for one sensor. The batch may arrive
    /// unsorted; the per-sensor vector stays sorted afterwards.
    pub fn add_readings(&self, sensor_id: &str, mut batch: Vec<Reading>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        if let Some(bad) = batch.iter().find(|r| r.sensor_id != sensor_id) {
            return Err(StoreError::MixedBatch {
                expected: sensor_id.to_string(),
                got: bad.sensor_id.clone(),
            });
        }
        let mut inner = self.inner.write();
        if !inner.sensors.iter().any(|s| s.id == sensor_id) {
            return Err(StoreError::UnknownSensor(sensor_id.to_string()));
        }
        batch.sort_by_key(|r| r.timestamp);
        let series = inner.readings.entry(sensor_id.to_string()).or_default();
        let in_order = series
            .last()
            .map(|last| last.timestamp <= batch[0].timestamp)
            .unwrap_or(true);
        series.extend(batch);
        if !in_order {
            series.sort_by_key(|r| r.timestamp);
        }
        Ok(())
    }

    pub fn sensors(&self) -> Vec<Sensor> {
        self.inner.read().sensors.clone()
    }

    pub fn sensor(&self, sensor_id: &str) -> Option<Sensor> {
        self.inner
            .read()
            .sensors
            .iter()
            .find(|s| s.id == sensor_id)
            .cloned()
    }

    /// Readings in the half-open interval [from, to), timestamp order.
    pub fn readings_in_range(
        &self,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Reading> {
        let inner = self.inner.read();
        let Some(series) = inner.readings.get(sensor_id) else {
            return Vec::new();
        };
        let lo = series.partition_point(|r| r.timestamp < from);
        let hi = series.partition_point(|r| r.timestamp < to);
        series[lo..hi].to_vec()
    }

    /// The most recent reading at or before `t`, or None before the first.
    pub fn reading_at(&self, sensor_id: &str, t: DateTime<Utc>) -> Option<Reading> {
        let inner = self.inner.read();
        let series = inner.readings.get(sensor_id)?;
        let idx = series.partition_point(|r| r.timestamp <= t);
        if idx == 0 {
            None
        } else {
            Some(series[idx - 1].clone())
        }
    }

    /// Min start / max end across all sensors, or None if no data at all.
    pub fn global_time_range(&self) -> Option<TimeRange> {
        let inner = self.inner.read();
        let mut start: Option<DateTime<Utc>> = None;
        let mut end: Option<DateTime<Utc>> = None;
        for series in inner.readings.values() {
            let (Some(first), Some(last)) = (series.first(), series.last()) else {
                continue;
            };
            start = Some(match start {
                Some(s) => s.min(first.timestamp),
                None => first.timestamp,
            });
            end = Some(match end {
                Some(e) => e.max(last.timestamp),
                None => last.timestamp,
            });
        }
        Some(TimeRange::new(start?, end?))
    }
}
