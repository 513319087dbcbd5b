//! Pairwise correlations with canonical pair ordering

use crate::ids::PointId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical unordered pair of points.
///
/// The pair is stored with the byte-wise smaller UUID first so that at most
/// one row per pair can exist in the correlation cache regardless of the
/// order in which the engine encountered the points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub a: PointId,
    pub b: PointId,
}

impl PairKey {
    /// Build the canonical form; the input order is irrelevant.
    pub fn new(x: PointId, y: PointId) -> Self {
        if x.as_bytes() <= y.as_bytes() {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    /// 32-byte store key: both UUIDs in canonical order
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(self.a.as_bytes());
        bytes[16..].copy_from_slice(self.b.as_bytes());
        bytes
    }
}

/// A current correlation entry for one pair of points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairCorrelation {
    pub pair: PairKey,
    /// Pearson r over time-aligned samples, in [-1, 1]
    pub r: f64,
    pub sample_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Lag (in milliseconds) at which |r| was maximal, if a lag search ran
    pub lag_ms: Option<i64>,
    /// The point whose signal leads, if a non-zero lag was retained
    pub leading: Option<PointId>,
    pub computed_at: DateTime<Utc>,
}

impl PairCorrelation {
    pub fn strength(&self) -> f64 {
        self.r.abs()
    }
}
