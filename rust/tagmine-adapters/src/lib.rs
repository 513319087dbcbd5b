//! Source-system adapters
//!
//! Adapters front external historians. Each capability is its own trait;
//! an adapter advertises what it supports through the accessor methods on
//! [`SourceAdapter`] and callers check before use. There is no inheritance
//! hierarchy and no downcasting.

pub mod backoff;
pub mod poll;
pub mod push;
pub mod queue;
pub mod registry;
pub mod replay;
pub mod sim;

pub use backoff::{Backoff, BreakerState, CircuitBreaker};
pub use poll::PollRunner;
pub use push::{PushRunner, PushSink, PushUpdate};
pub use queue::BoundedQueue;
pub use registry::{discover_and_register, AdapterMetricsSnapshot, AdapterRegistry};
pub use replay::{ReplayAdapter, ReplayOptions};
pub use sim::{SimPoint, SimulatedHistorian};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tagmine_core::{DataSourceId, DiscoveredPoint, Quality, TagmineResult, Value};

/// One source-level observation. The adapter does not know sequence ids;
/// identity resolution happens in the ingestion consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub value: Value,
    pub quality: Quality,
}

/// Adapter health as seen by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterHealth {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

/// Point discovery by name filter
#[async_trait]
pub trait Discover: Send + Sync {
    async fn discover_points(
        &self,
        filter: &str,
        max: usize,
    ) -> TagmineResult<Vec<DiscoveredPoint>>;
}

/// Batched current-value reads. Partial success is allowed: addresses the
/// source could not serve are simply absent from the result map.
#[async_trait]
pub trait ReadCurrent: Send + Sync {
    async fn read_current(&self, addresses: &[String])
        -> TagmineResult<HashMap<String, Reading>>;
}

/// Historical range reads, ordered by timestamp
#[async_trait]
pub trait ReadRange: Send + Sync {
    async fn read_range(
        &self,
        address: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TagmineResult<Vec<Reading>>;
}

/// Push subscription: the adapter delivers updates into the sink from its
/// own tasks. Backpressure is the sink's business (see [`PushSink`]).
pub trait Subscribe: Send + Sync {
    fn subscribe(&self, addresses: &[String], sink: PushSink) -> TagmineResult<()>;
}

/// An adapter instance fronting one data source
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn data_source_id(&self) -> DataSourceId;

    /// Cheap health snapshot; must not block on the remote system
    fn health(&self) -> AdapterHealth;

    fn discovery(&self) -> Option<&dyn Discover> {
        None
    }

    fn current_reader(&self) -> Option<&dyn ReadCurrent> {
        None
    }

    fn range_reader(&self) -> Option<&dyn ReadRange> {
        None
    }

    fn push_source(&self) -> Option<&dyn Subscribe> {
        None
    }
}

/// Glob-style matching for discovery filters: `*` matches any run of
/// characters, `?` exactly one. Matching is case-insensitive.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&pattern[1..], text) || (!text.is_empty() && inner(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => inner(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if p == t => inner(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();
    inner(&pattern, &text)
}
