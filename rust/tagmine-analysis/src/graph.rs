//! Weighted undirected correlation graph
//!
//! Nodes are points, edge weights are |r|. The graph is owned by the
//! cluster detector; algorithm passes run on a snapshot taken under a
//! short read lock, never on the live structure.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tagmine_core::PointId;

#[derive(Default)]
pub struct CorrelationGraph {
    adjacency: RwLock<HashMap<PointId, HashMap<PointId, f64>>>,
}

impl CorrelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an edge; weights are clamped to [0, 1]
    pub fn upsert_edge(&self, a: PointId, b: PointId, weight: f64) {
        if a == b {
            return;
        }
        let weight = weight.clamp(0.0, 1.0);
        let mut adjacency = self.adjacency.write();
        adjacency.entry(a).or_default().insert(b, weight);
        adjacency.entry(b).or_default().insert(a, weight);
    }

    pub fn remove_node(&self, node: &PointId) {
        let mut adjacency = self.adjacency.write();
        if let Some(neighbors) = adjacency.remove(node) {
            for neighbor in neighbors.keys() {
                if let Some(edges) = adjacency.get_mut(neighbor) {
                    edges.remove(node);
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.read().len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.read().values().map(|n| n.len()).sum::<usize>() / 2
    }

    /// Copy of the whole graph
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            adjacency: self.adjacency.read().clone(),
        }
    }

    /// Copy restricted to the given nodes plus their one-hop neighborhoods
    pub fn snapshot_around(&self, seeds: &HashSet<PointId>) -> GraphSnapshot {
        let adjacency = self.adjacency.read();
        let mut keep: HashSet<PointId> = seeds.clone();
        for seed in seeds {
            if let Some(neighbors) = adjacency.get(seed) {
                keep.extend(neighbors.keys().copied());
            }
        }
        let restricted = adjacency
            .iter()
            .filter(|(node, _)| keep.contains(node))
            .map(|(node, neighbors)| {
                let kept: HashMap<PointId, f64> = neighbors
                    .iter()
                    .filter(|(neighbor, _)| keep.contains(neighbor))
                    .map(|(neighbor, weight)| (*neighbor, *weight))
                    .collect();
                (*node, kept)
            })
            .collect();
        GraphSnapshot {
            adjacency: restricted,
        }
    }
}

/// Immutable copy of the graph for an algorithm pass
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub(crate) adjacency: HashMap<PointId, HashMap<PointId, f64>>,
}

impl GraphSnapshot {
    pub fn nodes(&self) -> Vec<PointId> {
        let mut nodes: Vec<PointId> = self.adjacency.keys().copied().collect();
        nodes.sort();
        nodes
    }

    pub fn neighbors(&self, node: &PointId) -> Option<&HashMap<PointId, f64>> {
        self.adjacency.get(node)
    }

    pub fn weight(&self, a: &PointId, b: &PointId) -> Option<f64> {
        self.adjacency.get(a).and_then(|n| n.get(b)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    /// (mean, min, max) of intra-cluster edge weights; None when the
    /// member set spans no edges at all
    pub fn cluster_stats(&self, members: &[PointId]) -> Option<(f64, f64, f64)> {
        let mut sum = 0.0;
        let mut count = 0u64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                if let Some(weight) = self.weight(a, b) {
                    sum += weight;
                    count += 1;
                    min = min.min(weight);
                    max = max.max(weight);
                }
            }
        }
        if count == 0 {
            None
        } else {
            Some((sum / count as f64, min, max))
        }
    }
}
