//! Ingestion consumer
//!
//! Reads `datapoints.raw`, resolves each sample's sequence id through an
//! LRU cache over the point metadata store, writes batches to the
//! time-series store and upserts the current-value cache. Offsets commit
//! only after those side-effects succeeded; both stores are idempotent, so
//! a replayed batch leaves the same terminal state.
//!
//! Samples for unknown points wait in a TTL retry buffer (the point may be
//! mid-registration); still unresolved after the window they go to the DLQ
//! with the original payload preserved.

use chrono::Utc;
use lru::LruCache;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tagmine_bus::{topics, Consumer, DlqEnvelope, MessageBus, Record};
use tagmine_config::IngestConfig;
use tagmine_core::{RawPoint, RawSampleBatch, Sample, TagmineError, TagmineResult};
use tagmine_store::{CurrentValueCache, MetadataStore, TimeSeriesStore};
use tokio::sync::watch;

const POLL_BATCH: usize = 32;
const IDLE_SLEEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
struct Resolved {
    sequence_id: u32,
    deleted: bool,
}

struct PendingSample {
    raw: RawPoint,
    origin_partition: usize,
    origin_offset: u64,
    deadline: Instant,
}

/// Counters exposed through health reporting
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    pub batches: u64,
    pub samples_written: u64,
    pub empty_batches: u64,
    pub contract_rejected: u64,
    pub deferred: u64,
    pub dead_lettered: u64,
    pub deleted_dropped: u64,
}

pub struct IngestWorker {
    consumer: Consumer,
    bus: Arc<MessageBus>,
    meta: Arc<MetadataStore>,
    series: Arc<TimeSeriesStore>,
    current: Arc<CurrentValueCache>,
    resolution: LruCache<String, Resolved>,
    retry: VecDeque<PendingSample>,
    retry_ttl: Duration,
    stats: IngestStats,
}

impl IngestWorker {
    pub fn new(
        bus: Arc<MessageBus>,
        meta: Arc<MetadataStore>,
        series: Arc<TimeSeriesStore>,
        current: Arc<CurrentValueCache>,
        config: &IngestConfig,
        partitions: Vec<usize>,
    ) -> TagmineResult<Self> {
        let capacity = NonZeroUsize::new(config.resolution_cache_size.max(1))
            .expect("max(1) is non-zero");
        let consumer = bus.consumer("ingest", topics::DATAPOINTS_RAW, partitions)?;
        Ok(Self {
            consumer,
            bus,
            meta,
            series,
            current,
            resolution: LruCache::new(capacity),
            retry: VecDeque::new(),
            retry_ttl: Duration::from_secs(config.retry_ttl_s),
            stats: IngestStats::default(),
        })
    }

    pub fn stats(&self) -> IngestStats {
        self.stats.clone()
    }

    /// Consume until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> TagmineResult<()> {
        tracing::info!(partitions = ?self.consumer.assigned(), "ingest worker started");
        let mut backoff = tagmine_adapters::Backoff::default();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.flush_retries(true)?;
                        tracing::info!(
                            batches = self.stats.batches,
                            samples = self.stats.samples_written,
                            "ingest worker stopping"
                        );
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
            }
            match self.process_available().await {
                Ok(_) => backoff.reset(),
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "ingest failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain everything currently readable; used by the run loop and
    /// driven directly by tests. Returns the number of records handled.
    pub async fn process_available(&mut self) -> TagmineResult<usize> {
        let result = self.process_inner();
        if result.is_err() {
            // Unwind to the committed offset; the stores are idempotent so
            // replaying the failed batch is safe
            let _ = self.consumer.rewind();
        }
        result
    }

    fn process_inner(&mut self) -> TagmineResult<usize> {
        let mut handled = 0;
        loop {
            let records = self.consumer.poll(POLL_BATCH)?;
            if records.is_empty() {
                break;
            }
            for record in records {
                self.process_record(&record)?;
                self.consumer.commit(&record)?;
                handled += 1;
            }
        }
        self.flush_retries(false)?;
        Ok(handled)
    }

    fn process_record(&mut self, record: &Record) -> TagmineResult<()> {
        let batch: RawSampleBatch = match record.decode() {
            Ok(batch) => batch,
            Err(e) => {
                // Poison: dead-letter and move on so the partition never
                // head-of-line blocks
                self.stats.dead_lettered += 1;
                self.bus
                    .route_to_dlq(record, &format!("undecodable raw batch: {}", e))?;
                return Ok(());
            }
        };

        if batch.points.is_empty() {
            // Boundary case: no state change, offset still commits
            self.stats.empty_batches += 1;
            return Ok(());
        }
        if let Err(e) = batch.validate() {
            self.stats.contract_rejected += 1;
            tracing::warn!(batch = %batch.batch_id, error = %e, "rejecting invalid batch at ingress");
            return Ok(());
        }

        let mut samples = Vec::with_capacity(batch.points.len());
        for raw in batch.points {
            match self.resolve(&raw.address)? {
                Some(resolved) if resolved.deleted => {
                    self.stats.deleted_dropped += 1;
                }
                Some(resolved) => samples.push(to_sample(&raw, resolved.sequence_id)),
                None => {
                    self.stats.deferred += 1;
                    self.retry.push_back(PendingSample {
                        raw,
                        origin_partition: record.partition,
                        origin_offset: record.offset,
                        deadline: Instant::now() + self.retry_ttl,
                    });
                }
            }
        }

        self.write(&samples)?;
        self.stats.batches += 1;
        Ok(())
    }

    fn write(&mut self, samples: &[Sample]) -> TagmineResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        self.series.write_batch(samples)?;
        for sample in samples {
            self.current.upsert(sample);
        }
        self.stats.samples_written += samples.len() as u64;
        Ok(())
    }

    fn resolve(&mut self, address: &str) -> TagmineResult<Option<Resolved>> {
        if let Some(resolved) = self.resolution.get(address) {
            return Ok(Some(*resolved));
        }
        let Some(point) = self.meta.point_by_address(address)? else {
            return Ok(None);
        };
        let resolved = Resolved {
            sequence_id: point.sequence_id,
            deleted: point.deleted,
        };
        self.resolution.put(address.to_string(), resolved);
        Ok(Some(resolved))
    }

    /// Retry deferred samples; expired ones go to the DLQ with the
    /// original payload. `force` expires everything (shutdown path).
    fn flush_retries(&mut self, force: bool) -> TagmineResult<()> {
        if self.retry.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let mut keep = VecDeque::new();
        while let Some(pending) = self.retry.pop_front() {
            match self.resolve(&pending.raw.address)? {
                Some(resolved) if resolved.deleted => {
                    self.stats.deleted_dropped += 1;
                }
                Some(resolved) => {
                    let sample = to_sample(&pending.raw, resolved.sequence_id);
                    self.write(std::slice::from_ref(&sample))?;
                }
                None if force || pending.deadline <= now => {
                    self.dead_letter_pending(&pending)?;
                }
                None => keep.push_back(pending),
            }
        }
        self.retry = keep;
        Ok(())
    }

    fn dead_letter_pending(&mut self, pending: &PendingSample) -> TagmineResult<()> {
        let payload = serde_json::to_vec(&pending.raw)
            .map_err(|e| TagmineError::Storage(format!("raw point encode failed: {}", e)))?;
        let envelope = DlqEnvelope {
            original_topic: topics::DATAPOINTS_RAW.to_string(),
            original_partition: pending.origin_partition,
            original_offset: pending.origin_offset,
            original_key: pending.raw.address.clone(),
            payload,
            reason: format!(
                "no point registered for address {} within the retry window",
                pending.raw.address
            ),
            failed_at: Utc::now(),
        };
        self.stats.dead_lettered += 1;
        tracing::warn!(address = %pending.raw.address, "unresolved sample dead-lettered");
        self.bus
            .publish(topics::DATAPOINTS_DLQ, &pending.raw.address, &envelope)?;
        Ok(())
    }
}

fn to_sample(raw: &RawPoint, sequence_id: u32) -> Sample {
    Sample {
        sequence_id,
        timestamp: raw.timestamp,
        value: raw.value.clone(),
        quality: raw.quality,
    }
}
