//! Behavioral clusters detected over the correlation graph

use crate::ids::{ClusterId, PointId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which community-detection algorithm produced a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterAlgorithm {
    Louvain,
    Dbscan,
}

/// Whether a scan was triggered by correlation events or by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanSource {
    Continuous,
    Scheduled,
}

/// A set of points bound by strong pairwise correlations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    /// Member point ids, kept sorted for a deterministic identity key
    pub member_ids: Vec<PointId>,
    /// Mean |r| over intra-cluster edges
    pub average_cohesion: f64,
    pub min_correlation: f64,
    pub max_correlation: f64,
    pub algorithm: ClusterAlgorithm,
    pub source: ScanSource,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Cluster {
    /// Deterministic identity key formed from the sorted member ids.
    /// Two detections of the same member set share this key.
    pub fn member_key(&self) -> String {
        let mut parts: Vec<String> = self.member_ids.iter().map(|id| id.to_string()).collect();
        parts.sort();
        parts.join("|")
    }

    pub fn size(&self) -> usize {
        self.member_ids.len()
    }

    pub fn contains(&self, point: &PointId) -> bool {
        self.member_ids.contains(point)
    }
}
