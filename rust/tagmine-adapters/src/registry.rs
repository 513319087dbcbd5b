//! Adapter registry
//!
//! Process-wide registry of adapter instances with a circuit breaker and
//! request counters per adapter. Guarded calls go through the breaker so a
//! flapping source system stops being hammered after a few consecutive
//! failures and gets probed again after the reset timeout.

use crate::backoff::{BreakerState, CircuitBreaker};
use crate::{AdapterHealth, Reading, SourceAdapter};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tagmine_config::AdapterConfig;
use tagmine_core::{Point, TagmineError, TagmineResult};
use tagmine_store::{MetadataStore, NewPoint};

#[derive(Default)]
struct AdapterStats {
    requests: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

struct AdapterEntry {
    adapter: Arc<dyn SourceAdapter>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    stats: Arc<AdapterStats>,
}

/// Point-in-time view of one adapter's counters
#[derive(Debug, Clone)]
pub struct AdapterMetricsSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub breaker: BreakerState,
    pub health: AdapterHealth,
}

#[derive(Default)]
pub struct AdapterRegistry {
    entries: DashMap<String, AdapterEntry>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn SourceAdapter>) -> TagmineResult<()> {
        let id = adapter.id().to_string();
        if self.entries.contains_key(&id) {
            return Err(TagmineError::ContractViolation(format!(
                "adapter {} already registered",
                id
            )));
        }
        self.entries.insert(
            id,
            AdapterEntry {
                adapter,
                breaker: Arc::new(Mutex::new(CircuitBreaker::default())),
                stats: Arc::new(AdapterStats::default()),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.entries.get(id).map(|e| e.adapter.clone())
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn health(&self, id: &str) -> Option<AdapterHealth> {
        self.entries.get(id).map(|e| e.adapter.health())
    }

    pub fn snapshot(&self, id: &str) -> Option<AdapterMetricsSnapshot> {
        self.entries.get(id).map(|e| AdapterMetricsSnapshot {
            requests: e.stats.requests.load(Ordering::Relaxed),
            failures: e.stats.failures.load(Ordering::Relaxed),
            last_error: e.stats.last_error.lock().clone(),
            breaker: e.breaker.lock().state(),
            health: e.adapter.health(),
        })
    }

    pub fn snapshots(&self) -> Vec<(String, AdapterMetricsSnapshot)> {
        self.list()
            .into_iter()
            .filter_map(|id| self.snapshot(&id).map(|s| (id, s)))
            .collect()
    }

    /// Current-value read through the adapter's circuit breaker
    pub async fn read_current_guarded(
        &self,
        id: &str,
        addresses: &[String],
    ) -> TagmineResult<HashMap<String, Reading>> {
        // Clone handles out so no map shard or lock is held across the await
        let (adapter, breaker, stats) = {
            let entry = self
                .entries
                .get(id)
                .ok_or_else(|| TagmineError::NotFound(format!("adapter {}", id)))?;
            (entry.adapter.clone(), entry.breaker.clone(), entry.stats.clone())
        };

        if !breaker.lock().allow() {
            return Err(TagmineError::TransientRemote(format!(
                "adapter {} circuit open",
                id
            )));
        }

        let reader = adapter.current_reader().ok_or_else(|| {
            TagmineError::Configuration(format!("adapter {} has no current-value capability", id))
        })?;

        stats.requests.fetch_add(1, Ordering::Relaxed);
        match reader.read_current(addresses).await {
            Ok(readings) => {
                breaker.lock().record_success();
                Ok(readings)
            }
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                *stats.last_error.lock() = Some(e.to_string());
                breaker.lock().record_failure();
                Err(e)
            }
        }
    }
}

/// Run discovery for an adapter and register what resolved.
///
/// Partial success: points that fail to register are logged and skipped;
/// the call succeeds if at least one point registered. A discovery that
/// matches nothing is an error to the caller.
pub async fn discover_and_register(
    adapter: &dyn SourceAdapter,
    meta: &MetadataStore,
    config: &AdapterConfig,
) -> TagmineResult<Vec<Point>> {
    let discovery = adapter.discovery().ok_or_else(|| {
        TagmineError::Configuration(format!(
            "adapter {} has no discovery capability",
            adapter.id()
        ))
    })?;

    let mut discovered = Vec::new();
    for filter in config
        .point_filters
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
    {
        let remaining = config.max_discovered_points.saturating_sub(discovered.len());
        if remaining == 0 {
            break;
        }
        let mut found = discovery.discover_points(filter, remaining).await?;
        found.retain(|p| !discovered.iter().any(|d: &tagmine_core::DiscoveredPoint| d.address == p.address));
        discovered.extend(found);
    }

    if discovered.is_empty() {
        return Err(TagmineError::NotFound(format!(
            "discovery on adapter {} matched no points for filters '{}'",
            adapter.id(),
            config.point_filters
        )));
    }

    let total = discovered.len();
    let mut registered = Vec::with_capacity(total);
    for point in discovered {
        match meta.register_point(NewPoint {
            name: point.name,
            address: point.address,
            description: point.description,
            unit: point.unit,
            value_kind: point.value_kind,
            data_source_id: Some(adapter.data_source_id()),
        }) {
            Ok(registered_point) => registered.push(registered_point),
            Err(e) => {
                tracing::warn!(adapter = %adapter.id(), error = %e, "failed to register discovered point");
            }
        }
    }

    if registered.is_empty() {
        return Err(TagmineError::Storage(format!(
            "none of {} discovered points could be registered",
            total
        )));
    }
    if registered.len() < total {
        tracing::warn!(
            adapter = %adapter.id(),
            registered = registered.len(),
            discovered = total,
            "discovery partially registered"
        );
    }
    Ok(registered)
}
