//! Cluster detector
//!
//! Owns the correlation graph. Correlation events refresh edges and mark
//! nodes dirty; scans run community detection on a snapshot (the dirty
//! neighborhood for event-driven scans, the whole graph for scheduled
//! ones), gate candidates on size and cohesion, and deduplicate against
//! previously emitted clusters so downstream only sees material changes.

use crate::dbscan;
use crate::graph::CorrelationGraph;
use crate::louvain;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tagmine_config::{ClusterAlgorithmKind, ClusteringConfig};
use tagmine_core::{
    Cluster, ClusterAlgorithm, ClusterId, CorrelationsUpdatedEvent, PointId, ScanSource,
    TagmineResult,
};
use tagmine_store::{CorrelationCache, MetadataStore};

/// Cohesion drift below this re-emits nothing for an unchanged member set
const COHESION_TOLERANCE: f64 = 0.02;

pub struct ClusterDetector {
    graph: CorrelationGraph,
    dirty: Mutex<HashSet<PointId>>,
    /// member_key -> cohesion at last emission
    emitted: DashMap<String, f64>,
    corr_cache: Arc<CorrelationCache>,
    meta: Arc<MetadataStore>,
    config: ClusteringConfig,
    last_scan: Mutex<Instant>,
}

impl ClusterDetector {
    pub fn new(
        corr_cache: Arc<CorrelationCache>,
        meta: Arc<MetadataStore>,
        config: ClusteringConfig,
    ) -> Self {
        Self {
            graph: CorrelationGraph::new(),
            dirty: Mutex::new(HashSet::new()),
            emitted: DashMap::new(),
            corr_cache,
            meta,
            config,
            last_scan: Mutex::new(Instant::now()),
        }
    }

    /// Refresh graph edges for the points touched by a correlation event
    /// and mark them dirty for the next scan.
    pub fn note_correlations(&self, event: &CorrelationsUpdatedEvent) {
        for point in &event.points {
            for correlation in self.corr_cache.for_point(point) {
                self.graph.upsert_edge(
                    correlation.pair.a,
                    correlation.pair.b,
                    correlation.strength(),
                );
            }
        }
        self.dirty.lock().extend(event.points.iter().copied());
    }

    /// Seconds since the last scan of any kind, for the fallback scheduler
    pub fn seconds_since_scan(&self) -> u64 {
        self.last_scan.lock().elapsed().as_secs()
    }

    pub fn graph_size(&self) -> (usize, usize) {
        (self.graph.node_count(), self.graph.edge_count())
    }

    /// Run one detection pass. Continuous scans cover the dirty
    /// neighborhood and are a no-op without dirty nodes; scheduled scans
    /// cover the whole graph.
    pub fn scan(&self, source: ScanSource) -> TagmineResult<Vec<Cluster>> {
        let snapshot = match source {
            ScanSource::Continuous => {
                let dirty: HashSet<PointId> = std::mem::take(&mut *self.dirty.lock());
                if dirty.is_empty() {
                    return Ok(Vec::new());
                }
                self.graph.snapshot_around(&dirty)
            }
            ScanSource::Scheduled => {
                self.dirty.lock().clear();
                self.graph.snapshot()
            }
        };
        *self.last_scan.lock() = Instant::now();
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let (algorithm, communities) = match self.config.cluster_algorithm {
            ClusterAlgorithmKind::Louvain => (
                ClusterAlgorithm::Louvain,
                louvain::detect_communities(&snapshot, self.config.max_iterations),
            ),
            ClusterAlgorithmKind::Dbscan => (
                ClusterAlgorithm::Dbscan,
                dbscan::detect_clusters(
                    &snapshot,
                    self.config.dbscan_eps,
                    self.config.dbscan_min_points,
                ),
            ),
        };

        let now = Utc::now();
        let mut accepted = Vec::new();
        for members in communities {
            if members.len() < self.config.min_cluster_size
                || members.len() > self.config.max_cluster_size
            {
                continue;
            }
            let Some((cohesion, min_r, max_r)) = snapshot.cluster_stats(&members) else {
                continue;
            };
            if cohesion < self.config.min_cohesion {
                continue;
            }

            let cluster = Cluster {
                id: ClusterId::new(),
                member_ids: members,
                average_cohesion: cohesion,
                min_correlation: min_r,
                max_correlation: max_r,
                algorithm,
                source,
                detected_at: now,
                expires_at: now + ChronoDuration::hours(self.config.cluster_ttl_h as i64),
            };

            if !self.materially_new(&cluster)? {
                continue;
            }
            self.meta.upsert_cluster(&cluster)?;
            self.emitted
                .insert(cluster.member_key(), cluster.average_cohesion);
            accepted.push(cluster);
        }

        tracing::debug!(
            source = ?source,
            emitted = accepted.len(),
            "cluster scan finished"
        );
        Ok(accepted)
    }

    /// Re-emit only when the member set is new or cohesion moved beyond
    /// the tolerance. Survives restarts via the durable cluster index.
    fn materially_new(&self, cluster: &Cluster) -> TagmineResult<bool> {
        let key = cluster.member_key();
        if let Some(prior) = self.emitted.get(&key) {
            return Ok((cluster.average_cohesion - *prior).abs() > COHESION_TOLERANCE);
        }
        if let Some(prior) = self.meta.cluster_for_members(&key)? {
            if (cluster.average_cohesion - prior.average_cohesion).abs() <= COHESION_TOLERANCE {
                self.emitted.insert(key, prior.average_cohesion);
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagmine_core::{PairCorrelation, PairKey};
    use uuid::Uuid;

    fn config(min_size: usize) -> ClusteringConfig {
        ClusteringConfig {
            cluster_algorithm: ClusterAlgorithmKind::Louvain,
            min_cluster_size: min_size,
            max_cluster_size: 20,
            min_cohesion: 0.5,
            dbscan_eps: 0.3,
            dbscan_min_points: 2,
            max_iterations: 10,
            scan_interval_s: 30,
            fallback_scan_s: 300,
            cluster_ttl_h: 24,
        }
    }

    fn detector(min_size: usize) -> (ClusterDetector, Arc<CorrelationCache>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let cache = Arc::new(CorrelationCache::new());
        (
            ClusterDetector::new(cache.clone(), meta, config(min_size)),
            cache,
            dir,
        )
    }

    fn correlate(cache: &CorrelationCache, a: PointId, b: PointId, r: f64) {
        cache.upsert(PairCorrelation {
            pair: PairKey::new(a, b),
            r,
            sample_count: 500,
            window_start: Utc::now(),
            window_end: Utc::now(),
            lag_ms: None,
            leading: None,
            computed_at: Utc::now(),
        });
    }

    fn event(points: Vec<PointId>) -> CorrelationsUpdatedEvent {
        CorrelationsUpdatedEvent {
            batch_id: Uuid::new_v4(),
            points,
            average_correlation: 0.9,
            produced_at: Utc::now(),
        }
    }

    #[test]
    fn test_cohesive_triangle_emitted_once() {
        let (detector, cache, _dir) = detector(3);
        let (a, b, c) = (PointId::new(), PointId::new(), PointId::new());
        correlate(&cache, a, b, 0.9);
        correlate(&cache, a, c, 0.9);
        correlate(&cache, b, c, 0.85);
        detector.note_correlations(&event(vec![a, b, c]));

        let clusters = detector.scan(ScanSource::Continuous).unwrap();
        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.size(), 3);
        assert!(cluster.average_cohesion >= 0.85);
        assert!((cluster.min_correlation - 0.85).abs() < 1e-12);

        // Unchanged graph: nothing dirty, nothing re-emitted
        assert!(detector.scan(ScanSource::Continuous).unwrap().is_empty());
        detector.note_correlations(&event(vec![a]));
        assert!(detector.scan(ScanSource::Continuous).unwrap().is_empty());
    }

    #[test]
    fn test_min_cluster_size_boundary() {
        // A pair is emitted at min size 2 and suppressed at min size 3
        for (min_size, expected) in [(2usize, 1usize), (3, 0)] {
            let (detector, cache, _dir) = detector(min_size);
            let (a, b) = (PointId::new(), PointId::new());
            correlate(&cache, a, b, 0.9);
            detector.note_correlations(&event(vec![a, b]));
            let clusters = detector.scan(ScanSource::Continuous).unwrap();
            assert_eq!(clusters.len(), expected, "min_size {}", min_size);
        }
    }

    #[test]
    fn test_low_cohesion_rejected() {
        let (detector, cache, _dir) = detector(3);
        let (a, b, c) = (PointId::new(), PointId::new(), PointId::new());
        correlate(&cache, a, b, 0.4);
        correlate(&cache, a, c, 0.4);
        correlate(&cache, b, c, 0.4);
        detector.note_correlations(&event(vec![a, b, c]));
        assert!(detector.scan(ScanSource::Continuous).unwrap().is_empty());
    }

    #[test]
    fn test_cohesion_drift_reemits() {
        let (detector, cache, _dir) = detector(3);
        let (a, b, c) = (PointId::new(), PointId::new(), PointId::new());
        correlate(&cache, a, b, 0.9);
        correlate(&cache, a, c, 0.9);
        correlate(&cache, b, c, 0.9);
        detector.note_correlations(&event(vec![a, b, c]));
        assert_eq!(detector.scan(ScanSource::Continuous).unwrap().len(), 1);

        // Cohesion moves well past the tolerance
        correlate(&cache, b, c, 0.6);
        detector.note_correlations(&event(vec![b, c]));
        let again = detector.scan(ScanSource::Continuous).unwrap();
        assert_eq!(again.len(), 1);
        assert!(again[0].average_cohesion < 0.9);
    }

    #[test]
    fn test_scheduled_scan_covers_whole_graph() {
        let (detector, cache, _dir) = detector(3);
        let (a, b, c) = (PointId::new(), PointId::new(), PointId::new());
        correlate(&cache, a, b, 0.9);
        correlate(&cache, a, c, 0.9);
        correlate(&cache, b, c, 0.9);
        detector.note_correlations(&event(vec![a, b, c]));
        // Continuous scan consumed the dirty set
        assert_eq!(detector.scan(ScanSource::Continuous).unwrap().len(), 1);

        // Scheduled scans do not need dirty nodes; dedup still applies
        let scheduled = detector.scan(ScanSource::Scheduled).unwrap();
        assert!(scheduled.is_empty());
    }
}
