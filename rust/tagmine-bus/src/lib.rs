//! Durable partitioned ingestion bus
//!
//! An append-only log per (topic, partition) persisted to sled, with ordered
//! delivery within a partition, at-least-once consumer semantics and
//! consumer groups over assigned partition subsets. Producers key messages
//! so that all samples of one source address land on one partition.
//!
//! Offsets are explicit: a consumer commits only after its side-effects
//! succeeded, so processing downstream must be idempotent.

pub mod bus;
pub mod consumer;
pub mod record;

pub use bus::MessageBus;
pub use consumer::Consumer;
pub use record::{DlqEnvelope, Record};

/// Well-known topic names
pub mod topics {
    /// Raw batches from adapters
    pub const DATAPOINTS_RAW: &str = "datapoints.raw";
    /// PointBehavior events from the aggregator
    pub const POINTS_BEHAVIOR: &str = "points.behavior";
    /// PairCorrelation events from the correlation engine
    pub const CORRELATIONS_UPDATED: &str = "correlations.updated";
    /// Cluster events from the cluster detector
    pub const CLUSTERS_CREATED: &str = "clusters.created";
    /// Suggestion events from the pattern matcher
    pub const SUGGESTIONS_CREATED: &str = "suggestions.created";
    /// Operator decisions from the UI bridge
    pub const PATTERNS_FEEDBACK: &str = "patterns.feedback";
    /// Pattern confidence updates from the feedback learner
    pub const PATTERNS_UPDATED: &str = "patterns.updated";
    /// Poison messages
    pub const DATAPOINTS_DLQ: &str = "datapoints.dlq";

    /// Every topic the platform creates at startup
    pub const ALL: &[&str] = &[
        DATAPOINTS_RAW,
        POINTS_BEHAVIOR,
        CORRELATIONS_UPDATED,
        CLUSTERS_CREATED,
        SUGGESTIONS_CREATED,
        PATTERNS_FEEDBACK,
        PATTERNS_UPDATED,
        DATAPOINTS_DLQ,
    ];
}
