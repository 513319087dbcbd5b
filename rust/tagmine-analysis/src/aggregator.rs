//! Behavioral aggregator
//!
//! One online summary per point, updated on every numeric sample. The
//! in-memory set is soft-bounded: past `max_points_in_memory` the 10%
//! least-recently-updated states are evicted with their partial summaries
//! persisted to the behavior cache.
//!
//! Publishing is damped twice: a per-point interval floor, and material
//! change thresholds against the last cached summary, so a stable point
//! does not spam the behavior topic.

use crate::welford::{IntervalReservoir, OnlineStats};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tagmine_config::BehaviorConfig;
use tagmine_core::{PointBehavior, PointId, Sample};
use tagmine_store::BehaviorCache;

const INTERVAL_RESERVOIR_CAPACITY: usize = 256;
const EPSILON: f64 = 1e-9;

struct PointState {
    point_id: PointId,
    sequence_id: u32,
    stats: OnlineStats,
    intervals: IntervalReservoir,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    last_timestamp: Option<DateTime<Utc>>,
    last_value: Option<f64>,
    zero_count: u64,
    good_count: u64,
    change_count: u64,
    last_published: Option<Instant>,
    last_updated: Instant,
}

impl PointState {
    fn new(point_id: PointId, sequence_id: u32, first_seen: DateTime<Utc>) -> Self {
        Self {
            point_id,
            sequence_id,
            stats: OnlineStats::new(),
            intervals: IntervalReservoir::new(INTERVAL_RESERVOIR_CAPACITY),
            window_start: first_seen,
            window_end: first_seen,
            last_timestamp: None,
            last_value: None,
            zero_count: 0,
            good_count: 0,
            change_count: 0,
            last_published: None,
            last_updated: Instant::now(),
        }
    }

    fn observe(&mut self, sample: &Sample, value: f64) {
        if let Some(last_ts) = self.last_timestamp {
            let interval_ms = (sample.timestamp - last_ts).num_milliseconds();
            if interval_ms > 0 {
                self.intervals.push(interval_ms as f64);
            }
        }
        if let Some(last_value) = self.last_value {
            if (value - last_value).abs() > f64::EPSILON {
                self.change_count += 1;
            }
        }
        self.stats.push(value);
        if value == 0.0 {
            self.zero_count += 1;
        }
        if sample.quality.is_good() {
            self.good_count += 1;
        }
        if sample.timestamp < self.window_start {
            self.window_start = sample.timestamp;
        }
        if sample.timestamp > self.window_end {
            self.window_end = sample.timestamp;
        }
        self.last_timestamp = Some(sample.timestamp);
        self.last_value = Some(value);
        self.last_updated = Instant::now();
    }

    fn behavior(&self) -> PointBehavior {
        let count = self.stats.count();
        PointBehavior {
            point_id: self.point_id,
            sequence_id: self.sequence_id,
            sample_count: count,
            window_start: self.window_start,
            window_end: self.window_end,
            mean: self.stats.mean(),
            stddev: self.stats.stddev(),
            min: self.stats.min(),
            max: self.stats.max(),
            median_interval_ms: self.intervals.median(),
            p95_interval_ms: self.intervals.p95(),
            zero_count: self.zero_count,
            good_quality_ratio: if count > 0 {
                self.good_count as f64 / count as f64
            } else {
                0.0
            },
            change_frequency: if count > 1 {
                self.change_count as f64 / (count - 1) as f64
            } else {
                0.0
            },
        }
    }
}

pub struct BehaviorAggregator {
    states: DashMap<u32, PointState>,
    cache: Arc<BehaviorCache>,
    config: BehaviorConfig,
}

impl BehaviorAggregator {
    pub fn new(cache: Arc<BehaviorCache>, config: BehaviorConfig) -> Self {
        Self {
            states: DashMap::new(),
            cache,
            config,
        }
    }

    /// Feed one sample. Returns a behavior to publish when the point is
    /// both mature enough and materially changed since the cached summary.
    pub fn observe(&self, point_id: PointId, sample: &Sample) -> Option<PointBehavior> {
        let value = sample.value.as_f64()?;

        let mut state = self
            .states
            .entry(sample.sequence_id)
            .or_insert_with(|| PointState::new(point_id, sample.sequence_id, sample.timestamp));
        state.observe(sample, value);

        if state.stats.count() < self.config.min_samples_for_behavior {
            return None;
        }
        if let Some(published) = state.last_published {
            if published.elapsed() < Duration::from_secs(self.config.publish_interval_s) {
                return None;
            }
        }

        let behavior = state.behavior();
        if !self.materially_changed(&behavior) {
            return None;
        }

        state.last_published = Some(Instant::now());
        drop(state);
        self.cache.put(behavior.clone());
        Some(behavior)
    }

    /// Change thresholds against the last cached behavior: >10% mean,
    /// >20% stddev or >30% median update rate. A point with no cached
    /// summary always counts as changed.
    fn materially_changed(&self, candidate: &PointBehavior) -> bool {
        let Some(cached) = self.cache.get(&candidate.point_id) else {
            return true;
        };
        let mean_shift =
            (candidate.mean - cached.mean).abs() / cached.mean.abs().max(EPSILON);
        if mean_shift > 0.10 {
            return true;
        }
        let stddev_shift =
            (candidate.stddev - cached.stddev).abs() / cached.stddev.max(EPSILON);
        if stddev_shift > 0.20 {
            return true;
        }
        let cached_rate = cached.update_rate_hz();
        let rate_shift =
            (candidate.update_rate_hz() - cached_rate).abs() / cached_rate.max(1.0);
        rate_shift > 0.30
    }

    /// Enforce the memory bound: past capacity, evict the 10% least
    /// recently updated states, persisting their partial summaries.
    /// Returns how many were evicted.
    pub fn evict_if_over_capacity(&self) -> usize {
        let len = self.states.len();
        if len <= self.config.max_points_in_memory {
            return 0;
        }
        let mut by_age: Vec<(u32, Instant)> = self
            .states
            .iter()
            .map(|entry| (*entry.key(), entry.value().last_updated))
            .collect();
        by_age.sort_by_key(|(_, updated)| *updated);

        let evict_count = (len / 10).max(1);
        let mut evicted = 0;
        for (sequence_id, _) in by_age.into_iter().take(evict_count) {
            if let Some((_, state)) = self.states.remove(&sequence_id) {
                self.cache.put(state.behavior());
                evicted += 1;
            }
        }
        tracing::debug!(evicted, remaining = self.states.len(), "aggregator eviction pass");
        evicted
    }

    /// Persist every live summary to the cache (shutdown checkpoint)
    pub fn checkpoint(&self) {
        for entry in self.states.iter() {
            self.cache.put(entry.value().behavior());
        }
    }

    pub fn tracked_points(&self) -> usize {
        self.states.len()
    }
}
