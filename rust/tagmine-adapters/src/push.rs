//! Push runner for subscription adapters
//!
//! The adapter delivers updates into a bounded [`PushSink`]; a pump task
//! drains the sink into raw batches on the bus. The queue bound and drop
//! policy come from configuration, so a paused consumer costs memory
//! proportional to the capacity, never unbounded growth.

use crate::queue::BoundedQueue;
use crate::{Reading, SourceAdapter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tagmine_bus::{topics, MessageBus};
use tagmine_config::AdapterConfig;
use tagmine_core::{RawPoint, RawSampleBatch, TagmineError, TagmineResult};
use tagmine_store::MetadataStore;
use tokio::sync::watch;

/// Pump wake-up period while the queue is empty
const PUMP_IDLE: Duration = Duration::from_millis(100);

/// One update delivered by a push adapter
#[derive(Debug, Clone)]
pub struct PushUpdate {
    pub address: String,
    pub reading: Reading,
}

/// Handle given to the adapter's subscription machinery
#[derive(Clone)]
pub struct PushSink {
    pub(crate) queue: Arc<BoundedQueue<PushUpdate>>,
}

impl PushSink {
    pub fn deliver(&self, update: PushUpdate) {
        self.queue.push(update);
    }

    /// Updates lost to the drop-oldest policy
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn buffered(&self) -> usize {
        self.queue.len()
    }
}

pub struct PushRunner {
    adapter: Arc<dyn SourceAdapter>,
    bus: Arc<MessageBus>,
    meta: Arc<MetadataStore>,
    config: AdapterConfig,
    queue: Arc<BoundedQueue<PushUpdate>>,
}

impl PushRunner {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        bus: Arc<MessageBus>,
        meta: Arc<MetadataStore>,
        config: AdapterConfig,
    ) -> Self {
        let queue = Arc::new(BoundedQueue::new(
            config.channel_capacity,
            config.drop_policy,
        ));
        Self {
            adapter,
            bus,
            meta,
            config,
            queue,
        }
    }

    pub fn sink(&self) -> PushSink {
        PushSink {
            queue: self.queue.clone(),
        }
    }

    /// Subscribe the adapter and pump its updates until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> TagmineResult<()> {
        let source = self.adapter.push_source().ok_or_else(|| {
            TagmineError::Configuration(format!(
                "adapter {} has no push capability",
                self.adapter.id()
            ))
        })?;

        let points = self
            .meta
            .points_for_data_source(&self.adapter.data_source_id())?;
        let names: HashMap<String, (String, Option<String>)> = points
            .iter()
            .map(|p| (p.address.clone(), (p.name.clone(), p.unit.clone())))
            .collect();
        let addresses: Vec<String> = points.into_iter().map(|p| p.address).collect();
        source.subscribe(&addresses, self.sink())?;
        tracing::info!(
            adapter = %self.adapter.id(),
            subscribed = addresses.len(),
            capacity = self.config.channel_capacity,
            "push runner started"
        );

        loop {
            let stopping = {
                tokio::select! {
                    _ = shutdown.changed() => *shutdown.borrow(),
                    _ = tokio::time::sleep(PUMP_IDLE) => false,
                }
            };

            self.pump(&names)?;

            if stopping {
                // Final drain so buffered updates are not lost on shutdown
                self.pump(&names)?;
                tracing::info!(
                    adapter = %self.adapter.id(),
                    dropped = self.queue.dropped(),
                    "push runner stopping"
                );
                return Ok(());
            }
        }
    }

    /// Drain buffered updates into raw batches on the bus
    fn pump(&self, names: &HashMap<String, (String, Option<String>)>) -> TagmineResult<usize> {
        let mut total = 0;
        loop {
            let updates = self.queue.drain(self.config.batch_size);
            if updates.is_empty() {
                return Ok(total);
            }
            total += updates.len();
            let raw_points: Vec<RawPoint> = updates
                .into_iter()
                .map(|update| {
                    let (name, unit) = names
                        .get(&update.address)
                        .cloned()
                        .map(|(n, u)| (Some(n), u))
                        .unwrap_or((None, None));
                    RawPoint {
                        address: update.address,
                        name,
                        timestamp: update.reading.timestamp,
                        value: update.reading.value,
                        quality: update.reading.quality,
                        unit,
                    }
                })
                .collect();
            let batch = RawSampleBatch::new(self.adapter.data_source_id(), raw_points);
            self.bus.publish(
                topics::DATAPOINTS_RAW,
                &self.adapter.data_source_id().to_string(),
                &batch,
            )?;
        }
    }
}
