//! Short-TTL caches for derived analytics
//!
//! Behaviors and correlations are derived data: the authoritative copy is
//! whatever the analysis stage computes next, so entries only need to live
//! long enough to feed downstream consumers. Purging runs from the
//! scheduled-jobs loop rather than on every read.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tagmine_core::{PairCorrelation, PairKey, PointBehavior, PointId};

struct Aged<T> {
    value: T,
    cached_at: Instant,
}

/// Latest behavioral summary per point
#[derive(Default)]
pub struct BehaviorCache {
    entries: DashMap<PointId, Aged<PointBehavior>>,
}

impl BehaviorCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn put(&self, behavior: PointBehavior) {
        self.entries.insert(
            behavior.point_id,
            Aged {
                value: behavior,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, point_id: &PointId) -> Option<PointBehavior> {
        self.entries.get(point_id).map(|aged| aged.value.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries older than the TTL; returns how many were removed
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, aged| aged.cached_at.elapsed() <= ttl);
        before - self.entries.len()
    }
}

/// Current correlation per canonical pair
#[derive(Default)]
pub struct CorrelationCache {
    entries: DashMap<PairKey, Aged<PairCorrelation>>,
}

impl CorrelationCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// At most one current entry per pair; later computations replace
    /// earlier ones.
    pub fn upsert(&self, correlation: PairCorrelation) {
        self.entries.insert(
            correlation.pair,
            Aged {
                value: correlation,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, pair: &PairKey) -> Option<PairCorrelation> {
        self.entries.get(pair).map(|aged| aged.value.clone())
    }

    /// Every cached pair involving the given point
    pub fn for_point(&self, point_id: &PointId) -> Vec<PairCorrelation> {
        self.entries
            .iter()
            .filter(|entry| entry.key().a == *point_id || entry.key().b == *point_id)
            .map(|entry| entry.value().value.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, aged| aged.cached_at.elapsed() <= ttl);
        before - self.entries.len()
    }
}
