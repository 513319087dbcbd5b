//! Core domain model for the tagmine platform
//!
//! Shared types flowing between adapters, the ingestion bus, storage tiers
//! and the analysis stages. Everything here is plain data: ids, samples,
//! behavioral summaries, correlations, clusters, patterns and the wire
//! events exchanged over the bus.

pub mod batch;
pub mod behavior;
pub mod cluster;
pub mod correlation;
pub mod error;
pub mod events;
pub mod ids;
pub mod pattern;
pub mod point;
pub mod suggestion;

pub use batch::{RawPoint, RawSampleBatch};
pub use behavior::PointBehavior;
pub use cluster::{Cluster, ClusterAlgorithm, ScanSource};
pub use correlation::{PairCorrelation, PairKey};
pub use error::{FailurePolicy, TagmineError, TagmineResult};
pub use events::{
    BehaviorEvent, ClusterCreatedEvent, ConfidenceChange, CorrelationsUpdatedEvent, FeedbackEvent,
    PatternUpdatedEvent, SuggestionCreatedEvent,
};
pub use ids::{ClusterId, DataSourceId, PatternId, PointId, SuggestionId};
pub use pattern::{Pattern, PatternRole};
pub use point::{
    DataSource, DataSourceStatus, DiscoveredPoint, Point, Quality, Sample, SourceKind, Value,
    ValueKind,
};
pub use suggestion::{
    FeedbackAction, FeedbackRecord, PatternBinding, Suggestion, SuggestionStatus,
};
