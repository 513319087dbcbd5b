//! Analysis-stage workers over the bus
//!
//! One worker type per stage, each a consumer group on its input topic.
//! Every worker follows the same discipline: decode, act, publish, commit
//! the offset last. Poison payloads are logged and committed (the DLQ only
//! receives raw-ingest poison; derived events are cheap to lose). Errors
//! with a Retry policy rewind to the committed offset and back off.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tagmine_adapters::Backoff;
use tagmine_analysis::{BehaviorAggregator, ClusterDetector, CorrelationEngine, SampleRing};
use tagmine_bus::{topics, Consumer, MessageBus, Record};
use tagmine_core::{
    BehaviorEvent, ClusterCreatedEvent, CorrelationsUpdatedEvent, FailurePolicy, FeedbackEvent,
    PointId, RawSampleBatch, ScanSource, TagmineResult,
};
use tagmine_match::{FeedbackLearner, PatternMatcher};
use tagmine_store::MetadataStore;
use tokio::sync::watch;

const POLL_BATCH: usize = 32;
const IDLE_SLEEP: Duration = Duration::from_millis(50);

/// Run a worker loop: wait, drain, repeat until shutdown. `drain` must be
/// safe to call again after an error (offsets only move on success).
async fn run_loop<F>(
    name: &str,
    mut shutdown: watch::Receiver<bool>,
    mut drain: F,
) -> TagmineResult<()>
where
    F: FnMut() -> TagmineResult<usize>,
{
    let mut backoff = Backoff::default();
    tracing::info!(worker = name, "worker started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Final drain so in-flight events are not stranded
                    if let Err(e) = drain() {
                        tracing::warn!(worker = name, error = %e, "final drain failed");
                    }
                    tracing::info!(worker = name, "worker stopping");
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(IDLE_SLEEP) => {}
        }
        match drain() {
            Ok(_) => backoff.reset(),
            Err(e) if e.policy() == FailurePolicy::Retry => {
                let delay = backoff.next_delay();
                tracing::warn!(worker = name, error = %e, retry_in_ms = delay.as_millis() as u64, "drain failed, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decode a record or log-and-skip. Derived-event topics tolerate loss.
fn decode_or_skip<T: serde::de::DeserializeOwned>(record: &Record) -> Option<T> {
    match record.decode() {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(
                topic = %record.topic,
                offset = record.offset,
                error = %e,
                "undecodable event skipped"
            );
            None
        }
    }
}

// ---- behavior aggregation ---------------------------------------------

/// Consumes `datapoints.raw` (its own consumer group, independent of the
/// ingestion consumer), feeds the sample ring and the aggregator, and
/// publishes behavior events.
pub struct BehaviorWorker {
    consumer: Consumer,
    bus: Arc<MessageBus>,
    meta: Arc<MetadataStore>,
    aggregator: Arc<BehaviorAggregator>,
    ring: Arc<SampleRing>,
    resolution: LruCache<String, Option<(PointId, u32)>>,
}

impl BehaviorWorker {
    pub fn new(
        bus: Arc<MessageBus>,
        meta: Arc<MetadataStore>,
        aggregator: Arc<BehaviorAggregator>,
        ring: Arc<SampleRing>,
        partitions: Vec<usize>,
    ) -> TagmineResult<Self> {
        let consumer = bus.consumer("behavior", topics::DATAPOINTS_RAW, partitions)?;
        Ok(Self {
            consumer,
            bus,
            meta,
            aggregator,
            ring,
            resolution: LruCache::new(NonZeroUsize::new(10_000).expect("non-zero")),
        })
    }

    pub fn drain(&mut self) -> TagmineResult<usize> {
        let result = self.drain_inner();
        if result.is_err() {
            // Unwind to the committed offset so the failed record replays
            let _ = self.consumer.rewind();
        }
        result
    }

    fn drain_inner(&mut self) -> TagmineResult<usize> {
        let mut handled = 0;
        loop {
            let records = self.consumer.poll(POLL_BATCH)?;
            if records.is_empty() {
                break;
            }
            for record in records {
                if let Some(batch) = decode_or_skip::<RawSampleBatch>(&record) {
                    self.observe_batch(&batch)?;
                }
                self.consumer.commit(&record)?;
                handled += 1;
            }
        }
        self.aggregator.evict_if_over_capacity();
        Ok(handled)
    }

    fn observe_batch(&mut self, batch: &RawSampleBatch) -> TagmineResult<()> {
        for raw in &batch.points {
            let resolved = match self.resolution.get(&raw.address) {
                Some(cached) => *cached,
                None => {
                    let looked_up = self
                        .meta
                        .point_by_address(&raw.address)?
                        .filter(|p| !p.deleted)
                        .map(|p| (p.id, p.sequence_id));
                    self.resolution.put(raw.address.clone(), looked_up);
                    looked_up
                }
            };
            let Some((point_id, sequence_id)) = resolved else {
                continue;
            };
            let Some(value) = raw.value.as_f64() else {
                continue;
            };

            let sample = tagmine_core::Sample {
                sequence_id,
                timestamp: raw.timestamp,
                value: raw.value.clone(),
                quality: raw.quality,
            };
            self.ring
                .push(sequence_id, raw.timestamp.timestamp_millis(), value);
            if let Some(behavior) = self.aggregator.observe(point_id, &sample) {
                self.bus.publish(
                    topics::POINTS_BEHAVIOR,
                    &point_id.to_string(),
                    &BehaviorEvent::from(&behavior),
                )?;
            }
        }
        Ok(())
    }

    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> TagmineResult<()> {
        let bus = self.bus.clone();
        let result = run_loop("behavior", shutdown, move || self.drain()).await;
        bus.flush()?;
        result
    }
}

// ---- correlation -------------------------------------------------------

pub struct CorrelationWorker {
    consumer: Consumer,
    bus: Arc<MessageBus>,
    engine: Arc<CorrelationEngine>,
}

impl CorrelationWorker {
    pub fn new(bus: Arc<MessageBus>, engine: Arc<CorrelationEngine>) -> TagmineResult<Self> {
        let consumer = bus.consumer_all("correlation", topics::POINTS_BEHAVIOR)?;
        Ok(Self {
            consumer,
            bus,
            engine,
        })
    }

    pub fn drain(&mut self) -> TagmineResult<usize> {
        let result = self.drain_inner();
        if result.is_err() {
            let _ = self.consumer.rewind();
        }
        result
    }

    fn drain_inner(&mut self) -> TagmineResult<usize> {
        let mut handled = 0;
        loop {
            let records = self.consumer.poll(POLL_BATCH)?;
            if records.is_empty() {
                return Ok(handled);
            }
            for record in records {
                if let Some(event) = decode_or_skip::<BehaviorEvent>(&record) {
                    if let Some(update) = self.engine.on_behavior(&event)? {
                        self.bus.publish(
                            topics::CORRELATIONS_UPDATED,
                            &update.batch_id.to_string(),
                            &update,
                        )?;
                    }
                }
                self.consumer.commit(&record)?;
                handled += 1;
            }
        }
    }

    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> TagmineResult<()> {
        run_loop("correlation", shutdown, move || self.drain()).await
    }
}

// ---- cluster detection -------------------------------------------------

pub struct ClusterWorker {
    consumer: Consumer,
    bus: Arc<MessageBus>,
    detector: Arc<ClusterDetector>,
    scan_interval: Duration,
}

impl ClusterWorker {
    pub fn new(
        bus: Arc<MessageBus>,
        detector: Arc<ClusterDetector>,
        scan_interval_s: u64,
    ) -> TagmineResult<Self> {
        let consumer = bus.consumer_all("clusters", topics::CORRELATIONS_UPDATED)?;
        Ok(Self {
            consumer,
            bus,
            detector,
            scan_interval: Duration::from_secs(scan_interval_s.max(1)),
        })
    }

    /// Absorb correlation events into the graph
    pub fn drain(&mut self) -> TagmineResult<usize> {
        let result = self.drain_inner();
        if result.is_err() {
            let _ = self.consumer.rewind();
        }
        result
    }

    fn drain_inner(&mut self) -> TagmineResult<usize> {
        let mut handled = 0;
        loop {
            let records = self.consumer.poll(POLL_BATCH)?;
            if records.is_empty() {
                return Ok(handled);
            }
            for record in records {
                if let Some(event) = decode_or_skip::<CorrelationsUpdatedEvent>(&record) {
                    self.detector.note_correlations(&event);
                }
                self.consumer.commit(&record)?;
                handled += 1;
            }
        }
    }

    /// Run one scan and publish accepted clusters
    pub fn scan_and_publish(&self, source: ScanSource) -> TagmineResult<usize> {
        let clusters = self.detector.scan(source)?;
        for cluster in &clusters {
            let event = ClusterCreatedEvent::from(cluster);
            self.bus
                .publish(topics::CLUSTERS_CREATED, &cluster.id.to_string(), &event)?;
            tracing::info!(
                cluster = %cluster.id,
                members = cluster.size(),
                cohesion = cluster.average_cohesion,
                "cluster published"
            );
        }
        Ok(clusters.len())
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> TagmineResult<()> {
        let mut scan_tick = tokio::time::interval(self.scan_interval);
        scan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = Backoff::default();
        tracing::info!(worker = "clusters", "worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!(worker = "clusters", "worker stopping");
                        return Ok(());
                    }
                }
                _ = scan_tick.tick() => {
                    if let Err(e) = self.scan_and_publish(ScanSource::Continuous) {
                        tracing::warn!(error = %e, "cluster scan failed");
                    }
                }
                _ = tokio::time::sleep(IDLE_SLEEP) => {
                    match self.drain() {
                        Ok(_) => backoff.reset(),
                        Err(e) if e.policy() == FailurePolicy::Retry => {
                            let delay = backoff.next_delay();
                            tracing::warn!(error = %e, "cluster drain failed, backing off");
                            tokio::time::sleep(delay).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

// ---- pattern matching --------------------------------------------------

pub struct MatcherWorker {
    consumer: Consumer,
    bus: Arc<MessageBus>,
    matcher: Arc<PatternMatcher>,
}

impl MatcherWorker {
    pub fn new(bus: Arc<MessageBus>, matcher: Arc<PatternMatcher>) -> TagmineResult<Self> {
        let consumer = bus.consumer_all("matcher", topics::CLUSTERS_CREATED)?;
        Ok(Self {
            consumer,
            bus,
            matcher,
        })
    }

    pub fn drain(&mut self) -> TagmineResult<usize> {
        let result = self.drain_inner();
        if result.is_err() {
            let _ = self.consumer.rewind();
        }
        result
    }

    fn drain_inner(&mut self) -> TagmineResult<usize> {
        let mut handled = 0;
        loop {
            let records = self.consumer.poll(POLL_BATCH)?;
            if records.is_empty() {
                return Ok(handled);
            }
            for record in records {
                if let Some(event) = decode_or_skip::<ClusterCreatedEvent>(&record) {
                    for suggestion in self.matcher.evaluate_cluster(&event)? {
                        self.bus.publish(
                            topics::SUGGESTIONS_CREATED,
                            &suggestion.id.to_string(),
                            &tagmine_core::SuggestionCreatedEvent::from(&suggestion),
                        )?;
                        tracing::info!(
                            suggestion = %suggestion.id,
                            pattern = %suggestion.pattern_name,
                            overall = suggestion.overall,
                            "suggestion published"
                        );
                    }
                }
                self.consumer.commit(&record)?;
                handled += 1;
            }
        }
    }

    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> TagmineResult<()> {
        run_loop("matcher", shutdown, move || self.drain()).await
    }
}

// ---- feedback ----------------------------------------------------------

pub struct FeedbackWorker {
    consumer: Consumer,
    bus: Arc<MessageBus>,
    learner: Arc<FeedbackLearner>,
}

impl FeedbackWorker {
    pub fn new(bus: Arc<MessageBus>, learner: Arc<FeedbackLearner>) -> TagmineResult<Self> {
        let consumer = bus.consumer_all("feedback", topics::PATTERNS_FEEDBACK)?;
        Ok(Self {
            consumer,
            bus,
            learner,
        })
    }

    pub fn drain(&mut self) -> TagmineResult<usize> {
        let result = self.drain_inner();
        if result.is_err() {
            let _ = self.consumer.rewind();
        }
        result
    }

    fn drain_inner(&mut self) -> TagmineResult<usize> {
        let mut handled = 0;
        loop {
            let records = self.consumer.poll(POLL_BATCH)?;
            if records.is_empty() {
                return Ok(handled);
            }
            for record in records {
                if let Some(event) = decode_or_skip::<FeedbackEvent>(&record) {
                    match self.learner.handle(&event) {
                        // Publication strictly after the metadata commit;
                        // a crash in between loses only the notification
                        Ok(Some(update)) => {
                            self.bus.publish(
                                topics::PATTERNS_UPDATED,
                                &update.pattern_id.to_string(),
                                &update,
                            )?;
                        }
                        Ok(None) => {}
                        Err(e) if e.policy() == FailurePolicy::Retry => return Err(e),
                        Err(e) => {
                            // Rejected decisions (double feedback, missing
                            // suggestion) are terminal for this record
                            tracing::warn!(
                                suggestion = %event.suggestion_id,
                                error = %e,
                                "feedback rejected"
                            );
                        }
                    }
                }
                self.consumer.commit(&record)?;
                handled += 1;
            }
        }
    }

    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> TagmineResult<()> {
        run_loop("feedback", shutdown, move || self.drain()).await
    }
}
