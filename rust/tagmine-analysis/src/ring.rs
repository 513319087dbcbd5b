//! Recent-sample rings
//!
//! Bounded per-point windows of (timestamp, value) pairs feeding the
//! correlation engine, so a correlation pass never has to touch the
//! time-series store for hot points. Contention is per point: each series
//! lives in its own DashMap shard entry.

use dashmap::DashMap;
use std::collections::VecDeque;

pub struct SampleRing {
    capacity: usize,
    series: DashMap<u32, VecDeque<(i64, f64)>>,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be > 0");
        Self {
            capacity,
            series: DashMap::new(),
        }
    }

    pub fn push(&self, sequence_id: u32, timestamp_ms: i64, value: f64) {
        let mut ring = self.series.entry(sequence_id).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back((timestamp_ms, value));
    }

    /// Snapshot of one point's window in arrival order
    pub fn series(&self, sequence_id: u32) -> Option<Vec<(i64, f64)>> {
        self.series
            .get(&sequence_id)
            .map(|ring| ring.iter().copied().collect())
    }

    pub fn len(&self, sequence_id: u32) -> usize {
        self.series.get(&sequence_id).map_or(0, |ring| ring.len())
    }

    pub fn tracked_points(&self) -> usize {
        self.series.len()
    }

    pub fn clear(&self, sequence_id: u32) {
        self.series.remove(&sequence_id);
    }
}
