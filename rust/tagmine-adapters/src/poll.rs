//! Polling runner for pull adapters
//!
//! One runner per adapter. Polls never overlap themselves: the loop awaits
//! the previous poll before the next tick fires, and an overrun is logged
//! with the next poll following immediately. Transient failures back off
//! exponentially with jitter; authentication failures stop this runner
//! without touching its peers.

use crate::backoff::Backoff;
use crate::{Reading, SourceAdapter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tagmine_bus::{topics, MessageBus};
use tagmine_config::AdapterConfig;
use tagmine_core::{Point, RawPoint, RawSampleBatch, TagmineError, TagmineResult};
use tagmine_store::MetadataStore;
use tokio::sync::watch;

/// Polls refresh their cached point list every this many cycles
const POINT_REFRESH_POLLS: u32 = 20;

pub struct PollRunner {
    adapter: Arc<dyn SourceAdapter>,
    bus: Arc<MessageBus>,
    meta: Arc<MetadataStore>,
    config: AdapterConfig,
    points: Vec<Point>,
    polls_since_refresh: u32,
}

impl PollRunner {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        bus: Arc<MessageBus>,
        meta: Arc<MetadataStore>,
        config: AdapterConfig,
    ) -> Self {
        Self {
            adapter,
            bus,
            meta,
            config,
            points: Vec::new(),
            polls_since_refresh: POINT_REFRESH_POLLS,
        }
    }

    /// Run until shutdown. Returns Ok on clean shutdown, Err only on a
    /// fatal (authentication / configuration) failure of this adapter.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> TagmineResult<()> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut backoff = Backoff::default();
        let mut overran = false;
        let adapter_id = self.adapter.id().to_string();
        tracing::info!(adapter = %adapter_id, interval_ms = self.config.poll_interval_ms, "poll runner started");

        loop {
            // After an overrun the next poll fires immediately; otherwise
            // wait out the interval (or a shutdown)
            if !overran {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            if *shutdown.borrow() {
                tracing::info!(adapter = %adapter_id, "poll runner stopping");
                return Ok(());
            }

            let started = Instant::now();
            match self.poll_once().await {
                Ok(samples) => {
                    backoff.reset();
                    tracing::debug!(adapter = %adapter_id, samples, "poll completed");
                }
                Err(e) if matches!(e, TagmineError::Authentication(_)) => {
                    tracing::error!(adapter = %adapter_id, error = %e, "fatal adapter failure, stopping runner");
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        adapter = %adapter_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "poll failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }

            let elapsed = started.elapsed();
            overran = elapsed > interval;
            if overran {
                tracing::warn!(
                    adapter = %adapter_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    interval_ms = interval.as_millis() as u64,
                    "poll overran its interval, polling again immediately"
                );
            }
        }
    }

    async fn poll_once(&mut self) -> TagmineResult<usize> {
        self.refresh_points_if_due()?;
        if self.points.is_empty() {
            return Ok(0);
        }

        let reader = self.adapter.current_reader().ok_or_else(|| {
            TagmineError::Configuration(format!(
                "adapter {} cannot be polled: no current-value capability",
                self.adapter.id()
            ))
        })?;

        let mut emitted = 0;
        for chunk in self.points.chunks(self.config.batch_size) {
            let addresses: Vec<String> = chunk.iter().map(|p| p.address.clone()).collect();
            let readings = reader.read_current(&addresses).await?;

            // Partial success: absent addresses are skipped, source order of
            // the present ones is preserved
            let raw_points: Vec<RawPoint> = chunk
                .iter()
                .filter_map(|point| {
                    readings.get(&point.address).map(|reading| {
                        to_raw_point(point, reading)
                    })
                })
                .collect();
            if raw_points.is_empty() {
                continue;
            }

            emitted += raw_points.len();
            let batch = RawSampleBatch::new(self.adapter.data_source_id(), raw_points);
            self.bus.publish(
                topics::DATAPOINTS_RAW,
                &self.adapter.data_source_id().to_string(),
                &batch,
            )?;
        }
        Ok(emitted)
    }

    fn refresh_points_if_due(&mut self) -> TagmineResult<()> {
        if self.polls_since_refresh >= POINT_REFRESH_POLLS || self.points.is_empty() {
            self.points = self
                .meta
                .points_for_data_source(&self.adapter.data_source_id())?;
            self.polls_since_refresh = 0;
        } else {
            self.polls_since_refresh += 1;
        }
        Ok(())
    }
}

fn to_raw_point(point: &Point, reading: &Reading) -> RawPoint {
    RawPoint {
        address: point.address.clone(),
        name: Some(point.name.clone()),
        timestamp: reading.timestamp,
        value: reading.value.clone(),
        quality: reading.quality,
        unit: point.unit.clone(),
    }
}
