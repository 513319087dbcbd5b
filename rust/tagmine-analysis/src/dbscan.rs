//! DBSCAN over correlation distance
//!
//! Distance between two points is 1 - |r| when an edge exists, infinite
//! otherwise, so `eps` directly expresses "at least |r| >= 1 - eps".
//! Core points need `min_points` neighbors (themselves included); border
//! points join the first core that reaches them; everything else is noise
//! and simply not reported.

use crate::graph::GraphSnapshot;
use std::collections::{HashMap, HashSet, VecDeque};
use tagmine_core::PointId;

pub fn detect_clusters(
    snapshot: &GraphSnapshot,
    eps: f64,
    min_points: usize,
) -> Vec<Vec<PointId>> {
    // d = 1 - w <= eps  <=>  w >= 1 - eps
    let min_weight = 1.0 - eps;
    let nodes = snapshot.nodes();

    let eps_neighbors = |node: &PointId| -> Vec<PointId> {
        snapshot
            .neighbors(node)
            .map(|neighbors| {
                neighbors
                    .iter()
                    .filter(|(_, &weight)| weight >= min_weight)
                    .map(|(neighbor, _)| *neighbor)
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut assigned: HashMap<PointId, usize> = HashMap::new();
    let mut clusters: Vec<Vec<PointId>> = Vec::new();

    for node in &nodes {
        if assigned.contains_key(node) {
            continue;
        }
        let neighbors = eps_neighbors(node);
        // The point itself counts toward the density requirement
        if neighbors.len() + 1 < min_points {
            continue;
        }

        // Expand a new cluster from this core point
        let cluster_idx = clusters.len();
        clusters.push(Vec::new());
        let mut queue: VecDeque<PointId> = VecDeque::new();
        let mut seen: HashSet<PointId> = HashSet::new();
        queue.push_back(*node);
        seen.insert(*node);

        while let Some(current) = queue.pop_front() {
            if assigned.contains_key(&current) {
                continue;
            }
            assigned.insert(current, cluster_idx);
            clusters[cluster_idx].push(current);

            let current_neighbors = eps_neighbors(&current);
            if current_neighbors.len() + 1 >= min_points {
                // Core point: its neighborhood keeps expanding the cluster
                for neighbor in current_neighbors {
                    if seen.insert(neighbor) {
                        queue.push_back(neighbor);
                    }
                }
            }
        }
    }

    for cluster in &mut clusters {
        cluster.sort();
    }
    clusters.retain(|c| !c.is_empty());
    clusters.sort_by(|a, b| a[0].cmp(&b[0]));
    clusters
}
