//! Current-value cache
//!
//! Latest sample per point, keyed by sequence id. Writes with a timestamp
//! older than the stored one are silently discarded and counted; this is
//! what makes replayed batches harmless to the "now" view.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tagmine_core::{Quality, Sample, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct CurrentValue {
    pub timestamp: DateTime<Utc>,
    pub value: Value,
    pub quality: Quality,
}

/// Counters exposed for health reporting
#[derive(Debug, Clone)]
pub struct CurrentValueStats {
    pub points: usize,
    pub accepted: u64,
    pub stale_discarded: u64,
}

#[derive(Default)]
pub struct CurrentValueCache {
    values: DashMap<u32, CurrentValue>,
    accepted: AtomicU64,
    stale_discarded: AtomicU64,
}

impl CurrentValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the sample if it is at least as new as the stored one.
    /// Returns whether the write was accepted.
    pub fn upsert(&self, sample: &Sample) -> bool {
        let mut accepted = true;
        let mut entry = self
            .values
            .entry(sample.sequence_id)
            .or_insert_with(|| CurrentValue {
                timestamp: sample.timestamp,
                value: sample.value.clone(),
                quality: sample.quality,
            });
        if sample.timestamp >= entry.timestamp {
            entry.timestamp = sample.timestamp;
            entry.value = sample.value.clone();
            entry.quality = sample.quality;
        } else {
            accepted = false;
        }
        drop(entry);

        if accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stale_discarded.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    pub fn get(&self, sequence_id: u32) -> Option<CurrentValue> {
        self.values.get(&sequence_id).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn stats(&self) -> CurrentValueStats {
        CurrentValueStats {
            points: self.values.len(),
            accepted: self.accepted.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(seq: u32, ts: DateTime<Utc>, value: f64) -> Sample {
        Sample {
            sequence_id: seq,
            timestamp: ts,
            value: Value::Float(value),
            quality: Quality::Good,
        }
    }

    #[test]
    fn test_newer_timestamp_wins() {
        let cache = CurrentValueCache::new();
        let t0 = Utc::now();
        assert!(cache.upsert(&sample(1, t0, 1.0)));
        assert!(cache.upsert(&sample(1, t0 + Duration::seconds(1), 2.0)));
        assert_eq!(cache.get(1).unwrap().value, Value::Float(2.0));
    }

    #[test]
    fn test_stale_write_discarded_and_counted() {
        let cache = CurrentValueCache::new();
        let t0 = Utc::now();
        cache.upsert(&sample(1, t0, 1.0));
        assert!(!cache.upsert(&sample(1, t0 - Duration::seconds(5), 9.0)));
        assert_eq!(cache.get(1).unwrap().value, Value::Float(1.0));
        assert_eq!(cache.stats().stale_discarded, 1);
    }

    #[test]
    fn test_equal_timestamp_accepted() {
        // Replaying the same batch must not count as a violation
        let cache = CurrentValueCache::new();
        let t0 = Utc::now();
        cache.upsert(&sample(1, t0, 1.0));
        assert!(cache.upsert(&sample(1, t0, 1.0)));
        assert_eq!(cache.stats().stale_discarded, 0);
    }
}
