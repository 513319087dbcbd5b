//! Scheduled jobs
//!
//! Three periodic duties: a fallback cluster scan when no event-driven
//! scan fired for the configured window, cache purges (behavior and
//! correlation TTLs, pending-suggestion expiry, aggregator capacity), and
//! a periodic pattern-confidence snapshot in the logs.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tagmine_analysis::{BehaviorAggregator, ClusterDetector};
use tagmine_bus::{topics, MessageBus};
use tagmine_config::TagmineConfig;
use tagmine_core::{ClusterCreatedEvent, ScanSource, TagmineResult};
use tagmine_store::{BehaviorCache, CorrelationCache, MetadataStore};
use tokio::sync::watch;

const JOBS_TICK: Duration = Duration::from_secs(30);
/// Confidence snapshots land every Nth tick
const SNAPSHOT_EVERY: u64 = 10;

pub struct ScheduledJobs {
    bus: Arc<MessageBus>,
    meta: Arc<MetadataStore>,
    detector: Arc<ClusterDetector>,
    behavior_cache: Arc<BehaviorCache>,
    corr_cache: Arc<CorrelationCache>,
    aggregator: Arc<BehaviorAggregator>,
    config: TagmineConfig,
}

impl ScheduledJobs {
    pub fn new(
        bus: Arc<MessageBus>,
        meta: Arc<MetadataStore>,
        detector: Arc<ClusterDetector>,
        behavior_cache: Arc<BehaviorCache>,
        corr_cache: Arc<CorrelationCache>,
        aggregator: Arc<BehaviorAggregator>,
        config: TagmineConfig,
    ) -> Self {
        Self {
            bus,
            meta,
            detector,
            behavior_cache,
            corr_cache,
            aggregator,
            config,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> TagmineResult<()> {
        let mut tick = tokio::time::interval(JOBS_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks = 0u64;
        tracing::info!("scheduled jobs started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("scheduled jobs stopping");
                        return Ok(());
                    }
                }
                _ = tick.tick() => {}
            }
            ticks += 1;
            if let Err(e) = self.run_once(ticks) {
                tracing::warn!(error = %e, "scheduled jobs pass failed");
            }
        }
    }

    /// One pass over all duties; fallible duties never skip the rest
    pub fn run_once(&self, ticks: u64) -> TagmineResult<()> {
        self.fallback_scan()?;
        self.purge_caches()?;
        if ticks % SNAPSHOT_EVERY == 0 {
            self.snapshot_confidences()?;
        }
        Ok(())
    }

    fn fallback_scan(&self) -> TagmineResult<()> {
        if self.detector.seconds_since_scan() < self.config.clustering.fallback_scan_s {
            return Ok(());
        }
        let clusters = self.detector.scan(ScanSource::Scheduled)?;
        for cluster in &clusters {
            self.bus.publish(
                topics::CLUSTERS_CREATED,
                &cluster.id.to_string(),
                &ClusterCreatedEvent::from(cluster),
            )?;
        }
        if !clusters.is_empty() {
            tracing::info!(count = clusters.len(), "fallback scan published clusters");
        }
        Ok(())
    }

    fn purge_caches(&self) -> TagmineResult<()> {
        let behavior_ttl = Duration::from_secs(self.config.behavior.behavior_cache_ttl_h * 3600);
        let purged_behaviors = self.behavior_cache.purge_expired(behavior_ttl);
        let purged_correlations = self.corr_cache.purge_expired(behavior_ttl);
        let cutoff = Utc::now()
            - ChronoDuration::hours(self.config.matching.suggestion_ttl_h as i64);
        let expired_suggestions = self.meta.expire_pending_before(cutoff)?;
        let evicted = self.aggregator.evict_if_over_capacity();
        if purged_behaviors + purged_correlations + expired_suggestions + evicted > 0 {
            tracing::debug!(
                purged_behaviors,
                purged_correlations,
                expired_suggestions,
                evicted,
                "purge pass"
            );
        }
        Ok(())
    }

    fn snapshot_confidences(&self) -> TagmineResult<()> {
        for pattern in self.meta.list_patterns()? {
            tracing::info!(
                pattern = %pattern.name,
                confidence = pattern.confidence,
                active = pattern.active,
                feedback = self.meta.feedback_count(&pattern.id)?,
                "pattern confidence snapshot"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagmine_analysis::{BehaviorAggregator, ClusterDetector};
    use tagmine_config::TagmineConfig;

    #[tokio::test]
    async fn test_run_once_is_safe_on_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MessageBus::open(dir.path().join("bus"), 1).unwrap();
        let meta = Arc::new(MetadataStore::open(dir.path().join("meta")).unwrap());
        let behavior_cache = Arc::new(BehaviorCache::new());
        let corr_cache = Arc::new(CorrelationCache::new());
        let config = TagmineConfig::default();
        let jobs = ScheduledJobs::new(
            bus,
            meta.clone(),
            Arc::new(ClusterDetector::new(
                corr_cache.clone(),
                meta,
                config.clustering.clone(),
            )),
            behavior_cache,
            corr_cache,
            Arc::new(BehaviorAggregator::new(
                Arc::new(BehaviorCache::new()),
                config.behavior.clone(),
            )),
            config,
        );
        jobs.run_once(1).unwrap();
        jobs.run_once(SNAPSHOT_EVERY).unwrap();
    }
}
