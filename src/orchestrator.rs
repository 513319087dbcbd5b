//! Service orchestrator
//!
//! Owns the component lifecycle. Startup order: adapters, then ingestion
//! workers, then analysis workers, then scheduled jobs. Shutdown reverses
//! the intent: adapters stop first so the bus drains, consumers finish
//! their final drain, the aggregator checkpoints its state to the
//! behavior cache, and the stores flush.
//!
//! A component failure marks it in the health map and never takes down
//! its peers.

use crate::ingest::IngestWorker;
use crate::jobs::ScheduledJobs;
use crate::workers::{
    BehaviorWorker, ClusterWorker, CorrelationWorker, FeedbackWorker, MatcherWorker,
};
use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tagmine_adapters::{
    discover_and_register, AdapterRegistry, PollRunner, PushRunner, SourceAdapter,
};
use tagmine_analysis::{
    BehaviorAggregator, ClusterDetector, CorrelationEngine, SampleRing,
};
use tagmine_bus::MessageBus;
use tagmine_config::TagmineConfig;
use tagmine_core::{DataSource, DataSourceStatus, SourceKind, TagmineResult};
use tagmine_match::{builtin_patterns, FeedbackLearner, PatternMatcher};
use tagmine_store::{
    BehaviorCache, CorrelationCache, CurrentValueCache, MetadataStore, TimeSeriesStore,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Correlation window per point
const RING_CAPACITY: usize = 2048;
/// Pause between stopping producers and stopping consumers, so the final
/// drains see what the adapters flushed
const DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentHealth {
    Running,
    Stopped,
    Failed(String),
}

pub struct Orchestrator {
    config: TagmineConfig,
    pub bus: Arc<MessageBus>,
    pub meta: Arc<MetadataStore>,
    pub series: Arc<TimeSeriesStore>,
    pub current: Arc<CurrentValueCache>,
    pub behavior_cache: Arc<BehaviorCache>,
    pub corr_cache: Arc<CorrelationCache>,
    pub ring: Arc<SampleRing>,
    pub aggregator: Arc<BehaviorAggregator>,
    pub engine: Arc<CorrelationEngine>,
    pub detector: Arc<ClusterDetector>,
    pub matcher: Arc<PatternMatcher>,
    pub learner: Arc<FeedbackLearner>,
    pub registry: Arc<AdapterRegistry>,
    adapters_stop: watch::Sender<bool>,
    workers_stop: watch::Sender<bool>,
    adapter_handles: Vec<(String, JoinHandle<()>)>,
    worker_handles: Vec<(String, JoinHandle<()>)>,
    health: Arc<DashMap<String, ComponentHealth>>,
}

impl Orchestrator {
    /// Open stores under the configured data dir and wire the engines.
    /// Seeds the built-in pattern library on first start.
    pub fn new(config: TagmineConfig) -> TagmineResult<Self> {
        let data_dir = Path::new(&config.service.data_dir);
        let bus = MessageBus::open(data_dir.join("bus"), config.service.partitions)?;
        let meta = Arc::new(MetadataStore::open(data_dir.join("meta"))?);
        let series = Arc::new(TimeSeriesStore::open(data_dir.join("series"))?);
        let current = Arc::new(CurrentValueCache::new());
        let behavior_cache = Arc::new(BehaviorCache::new());
        let corr_cache = Arc::new(CorrelationCache::new());
        let ring = Arc::new(SampleRing::new(RING_CAPACITY));

        if meta.list_patterns()?.is_empty() {
            let seeded = builtin_patterns(config.feedback.initial_pattern_confidence);
            tracing::info!(count = seeded.len(), "seeding built-in pattern library");
            for pattern in seeded {
                meta.save_pattern(&pattern)?;
            }
        }

        let aggregator = Arc::new(BehaviorAggregator::new(
            behavior_cache.clone(),
            config.behavior.clone(),
        ));
        let engine = Arc::new(CorrelationEngine::new(
            ring.clone(),
            meta.clone(),
            corr_cache.clone(),
            config.correlation.clone(),
        ));
        let detector = Arc::new(ClusterDetector::new(
            corr_cache.clone(),
            meta.clone(),
            config.clustering.clone(),
        ));
        let matcher = Arc::new(PatternMatcher::new(
            meta.clone(),
            behavior_cache.clone(),
            config.matching.clone(),
        ));
        let learner = Arc::new(FeedbackLearner::new(meta.clone(), config.feedback.clone()));

        let (adapters_stop, _) = watch::channel(false);
        let (workers_stop, _) = watch::channel(false);
        Ok(Self {
            config,
            bus,
            meta,
            series,
            current,
            behavior_cache,
            corr_cache,
            ring,
            aggregator,
            engine,
            detector,
            matcher,
            learner,
            registry: Arc::new(AdapterRegistry::new()),
            adapters_stop,
            workers_stop,
            adapter_handles: Vec::new(),
            worker_handles: Vec::new(),
            health: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &TagmineConfig {
        &self.config
    }

    /// Register an adapter, record its data source, and optionally run
    /// discovery. Returns how many points discovery registered.
    pub async fn register_adapter(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        discover: bool,
    ) -> TagmineResult<usize> {
        // Seeded records (e.g. replay sources with their file lists) keep
        // their kind and connection; only unknown sources get a fresh row
        if self.meta.get_data_source(&adapter.data_source_id())?.is_none() {
            let kind = if adapter.push_source().is_some() {
                SourceKind::Push
            } else {
                SourceKind::Pull
            };
            self.meta.save_data_source(&DataSource {
                id: adapter.data_source_id(),
                name: adapter.id().to_string(),
                kind,
                connection: String::new(),
                status: DataSourceStatus::Active,
                created_at: Utc::now(),
            })?;
        }
        self.registry.register(adapter.clone())?;

        if discover && adapter.discovery().is_some() {
            let registered =
                discover_and_register(adapter.as_ref(), &self.meta, &self.config.adapter).await?;
            return Ok(registered.len());
        }
        Ok(0)
    }

    fn spawn(
        handles: &mut Vec<(String, JoinHandle<()>)>,
        health: &Arc<DashMap<String, ComponentHealth>>,
        name: String,
        task: impl Future<Output = TagmineResult<()>> + Send + 'static,
    ) {
        health.insert(name.clone(), ComponentHealth::Running);
        let health = health.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            match task.await {
                Ok(()) => {
                    health.insert(task_name, ComponentHealth::Stopped);
                }
                Err(e) => {
                    tracing::error!(component = %task_name, error = %e, "component failed");
                    health.insert(task_name, ComponentHealth::Failed(e.to_string()));
                }
            }
        });
        handles.push((name, handle));
    }

    /// Start everything: adapters, then consumers, then analysis, then
    /// scheduled jobs.
    pub fn start(&mut self) -> TagmineResult<()> {
        // Adapters first: producers fill the bus while consumers spin up
        for id in self.registry.list() {
            let Some(adapter) = self.registry.get(&id) else {
                continue;
            };
            if adapter.push_source().is_some() {
                let runner = PushRunner::new(
                    adapter,
                    self.bus.clone(),
                    self.meta.clone(),
                    self.config.adapter.clone(),
                );
                Self::spawn(
                    &mut self.adapter_handles,
                    &self.health,
                    format!("adapter/{}", id),
                    runner.run(self.adapters_stop.subscribe()),
                );
            } else if adapter.current_reader().is_some() {
                let runner = PollRunner::new(
                    adapter,
                    self.bus.clone(),
                    self.meta.clone(),
                    self.config.adapter.clone(),
                );
                Self::spawn(
                    &mut self.adapter_handles,
                    &self.health,
                    format!("adapter/{}", id),
                    runner.run(self.adapters_stop.subscribe()),
                );
            } else {
                tracing::warn!(adapter = %id, "adapter has no pollable or push capability");
            }
        }

        // Ingestion and behavior workers, one per partition
        for partition in 0..self.bus.partitions() {
            let ingest = IngestWorker::new(
                self.bus.clone(),
                self.meta.clone(),
                self.series.clone(),
                self.current.clone(),
                &self.config.ingest,
                vec![partition],
            )?;
            Self::spawn(
                &mut self.worker_handles,
                &self.health,
                format!("ingest/{}", partition),
                ingest.run(self.workers_stop.subscribe()),
            );

            let behavior = BehaviorWorker::new(
                self.bus.clone(),
                self.meta.clone(),
                self.aggregator.clone(),
                self.ring.clone(),
                vec![partition],
            )?;
            Self::spawn(
                &mut self.worker_handles,
                &self.health,
                format!("behavior/{}", partition),
                behavior.run(self.workers_stop.subscribe()),
            );
        }

        // Analysis chain
        let correlation = CorrelationWorker::new(self.bus.clone(), self.engine.clone())?;
        Self::spawn(
            &mut self.worker_handles,
            &self.health,
            "correlation".to_string(),
            correlation.run(self.workers_stop.subscribe()),
        );

        let clusters = ClusterWorker::new(
            self.bus.clone(),
            self.detector.clone(),
            self.config.clustering.scan_interval_s,
        )?;
        Self::spawn(
            &mut self.worker_handles,
            &self.health,
            "clusters".to_string(),
            clusters.run(self.workers_stop.subscribe()),
        );

        let matcher = MatcherWorker::new(self.bus.clone(), self.matcher.clone())?;
        Self::spawn(
            &mut self.worker_handles,
            &self.health,
            "matcher".to_string(),
            matcher.run(self.workers_stop.subscribe()),
        );

        let feedback = FeedbackWorker::new(self.bus.clone(), self.learner.clone())?;
        Self::spawn(
            &mut self.worker_handles,
            &self.health,
            "feedback".to_string(),
            feedback.run(self.workers_stop.subscribe()),
        );

        // Scheduled jobs last
        let jobs = ScheduledJobs::new(
            self.bus.clone(),
            self.meta.clone(),
            self.detector.clone(),
            self.behavior_cache.clone(),
            self.corr_cache.clone(),
            self.aggregator.clone(),
            self.config.clone(),
        );
        Self::spawn(
            &mut self.worker_handles,
            &self.health,
            "jobs".to_string(),
            jobs.run(self.workers_stop.subscribe()),
        );

        tracing::info!(
            adapters = self.adapter_handles.len(),
            workers = self.worker_handles.len(),
            "orchestrator started"
        );
        Ok(())
    }

    /// Stop in order: adapters drain into the bus, consumers finish, the
    /// aggregator checkpoints, stores flush.
    pub async fn shutdown(mut self) -> TagmineResult<()> {
        tracing::info!("shutdown requested");
        let _ = self.adapters_stop.send(true);
        for (name, handle) in self.adapter_handles.drain(..) {
            if handle.await.is_err() {
                tracing::warn!(component = %name, "adapter task panicked");
            }
        }

        tokio::time::sleep(DRAIN_GRACE).await;
        let _ = self.workers_stop.send(true);
        for (name, handle) in self.worker_handles.drain(..) {
            if handle.await.is_err() {
                tracing::warn!(component = %name, "worker task panicked");
            }
        }

        self.aggregator.checkpoint();
        self.bus.flush()?;
        self.series.flush()?;
        self.meta.flush()?;
        tracing::info!("shutdown complete");
        Ok(())
    }

    pub fn health_snapshot(&self) -> Vec<(String, ComponentHealth)> {
        let mut snapshot: Vec<(String, ComponentHealth)> = self
            .health
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Degraded when any component failed; healthy while everything that
    /// was started is still running or stopped cleanly
    pub fn is_degraded(&self) -> bool {
        self.health
            .iter()
            .any(|entry| matches!(entry.value(), ComponentHealth::Failed(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagmine_adapters::{SimPoint, SimulatedHistorian};
    use tagmine_core::DataSourceId;

    fn test_config(dir: &Path) -> TagmineConfig {
        let mut config = TagmineConfig::default();
        config.service.data_dir = dir.to_string_lossy().into_owned();
        config.service.partitions = 2;
        config
    }

    #[tokio::test]
    async fn test_new_seeds_pattern_library_once() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(test_config(dir.path())).unwrap();
        let first = orchestrator.meta.list_patterns().unwrap().len();
        assert!(first >= 3);
        drop(orchestrator);

        let orchestrator = Orchestrator::new(test_config(dir.path())).unwrap();
        assert_eq!(orchestrator.meta.list_patterns().unwrap().len(), first);
    }

    #[tokio::test]
    async fn test_register_adapter_with_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(test_config(dir.path())).unwrap();
        let ds = DataSourceId::new();
        let historian = Arc::new(
            SimulatedHistorian::new("sim", ds)
                .with_point(SimPoint::analog("hvac.ahu1.sat", 14.0, 2.0, 300.0))
                .with_point(SimPoint::analog("hvac.ahu1.rat", 22.0, 2.0, 300.0)),
        );
        let discovered = orchestrator.register_adapter(historian, true).await.unwrap();
        assert_eq!(discovered, 2);
        assert_eq!(orchestrator.meta.points_for_data_source(&ds).unwrap().len(), 2);
        assert_eq!(orchestrator.registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_clean_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(test_config(dir.path())).unwrap();
        let ds = DataSourceId::new();
        let historian = Arc::new(
            SimulatedHistorian::new("sim", ds)
                .with_point(SimPoint::analog("hvac.ahu1.sat", 14.0, 2.0, 300.0)),
        );
        orchestrator.register_adapter(historian, true).await.unwrap();
        orchestrator.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!orchestrator.is_degraded());
        orchestrator.shutdown().await.unwrap();
    }
}
