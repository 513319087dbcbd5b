//! Wire events exchanged over the bus
//!
//! These are the logical shapes of §external interfaces; the bus encodes
//! them as JSON. `datapoints.raw` carries [`crate::RawSampleBatch`] directly.

use crate::behavior::PointBehavior;
use crate::cluster::{Cluster, ScanSource};
use crate::ids::{ClusterId, PatternId, PointId, SuggestionId};
use crate::suggestion::{FeedbackAction, Suggestion};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `points.behavior` payload, keyed by point id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub point_id: PointId,
    pub point_sequence_id: u32,
    pub sample_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub update_rate_hz: f64,
    pub produced_at: DateTime<Utc>,
}

impl From<&PointBehavior> for BehaviorEvent {
    fn from(b: &PointBehavior) -> Self {
        Self {
            point_id: b.point_id,
            point_sequence_id: b.sequence_id,
            sample_count: b.sample_count,
            window_start: b.window_start,
            window_end: b.window_end,
            mean: b.mean,
            stddev: b.stddev,
            min: b.min,
            max: b.max,
            update_rate_hz: b.update_rate_hz(),
            produced_at: Utc::now(),
        }
    }
}

/// `correlations.updated` payload: the points newly linked by one computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationsUpdatedEvent {
    pub batch_id: Uuid,
    pub points: Vec<PointId>,
    pub average_correlation: f64,
    pub produced_at: DateTime<Utc>,
}

/// `clusters.created` payload, keyed by cluster id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCreatedEvent {
    pub cluster_id: ClusterId,
    pub source: ScanSource,
    pub point_ids: Vec<PointId>,
    pub cohesion: f64,
    pub min_r: f64,
    pub max_r: f64,
    pub produced_at: DateTime<Utc>,
}

impl From<&Cluster> for ClusterCreatedEvent {
    fn from(c: &Cluster) -> Self {
        Self {
            cluster_id: c.id,
            source: c.source,
            point_ids: c.member_ids.clone(),
            cohesion: c.average_cohesion,
            min_r: c.min_correlation,
            max_r: c.max_correlation,
            produced_at: Utc::now(),
        }
    }
}

/// `suggestions.created` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionCreatedEvent {
    pub suggestion_id: SuggestionId,
    pub cluster_id: ClusterId,
    pub pattern_id: PatternId,
    pub pattern_name: String,
    pub overall: f64,
    pub naming: f64,
    pub correlation: f64,
    pub range: f64,
    pub rate: f64,
    pub evidence: Vec<String>,
    pub point_count: usize,
    pub produced_at: DateTime<Utc>,
}

impl From<&Suggestion> for SuggestionCreatedEvent {
    fn from(s: &Suggestion) -> Self {
        Self {
            suggestion_id: s.id,
            cluster_id: s.cluster_id,
            pattern_id: s.pattern_id,
            pattern_name: s.pattern_name.clone(),
            overall: s.overall,
            naming: s.naming_score,
            correlation: s.correlation_score,
            range: s.range_score,
            rate: s.rate_score,
            evidence: s.evidence.clone(),
            point_count: s.matched_points.len(),
            produced_at: Utc::now(),
        }
    }
}

/// `patterns.feedback` payload from the operator UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub suggestion_id: SuggestionId,
    pub action: FeedbackAction,
    pub user_id: Option<String>,
    pub reason: Option<String>,
    pub confidence_at_action: f64,
}

/// Direction of a confidence change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceChange {
    IncreasedConfidence,
    DecreasedConfidence,
}

/// `patterns.updated` payload emitted after a feedback commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternUpdatedEvent {
    pub pattern_id: PatternId,
    pub kind: ConfidenceChange,
    pub old_confidence: f64,
    pub new_confidence: f64,
    /// Total feedback decisions recorded for this pattern so far
    pub example_count: u64,
    pub produced_at: DateTime<Utc>,
}
