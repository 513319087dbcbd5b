//! Behavioral summaries derived from a point's recent samples

use crate::ids::PointId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sliding-window statistical summary of one point.
///
/// Derived data: the latest summary per point lives in a short-TTL cache and
/// is never stored durably beyond that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointBehavior {
    pub point_id: PointId,
    pub sequence_id: u32,
    pub sample_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    /// Median inter-sample interval in milliseconds
    pub median_interval_ms: f64,
    /// 95th percentile inter-sample interval in milliseconds
    pub p95_interval_ms: f64,
    pub zero_count: u64,
    /// Fraction of samples with Good quality, in [0, 1]
    pub good_quality_ratio: f64,
    /// Fraction of consecutive sample pairs that changed value, in [0, 1]
    pub change_frequency: f64,
}

impl PointBehavior {
    /// Observed update rate derived from the median interval
    pub fn update_rate_hz(&self) -> f64 {
        if self.median_interval_ms > 0.0 {
            1000.0 / self.median_interval_ms
        } else {
            0.0
        }
    }

    /// Observed value span, used by range scoring
    pub fn observed_range(&self) -> f64 {
        self.max - self.min
    }
}
