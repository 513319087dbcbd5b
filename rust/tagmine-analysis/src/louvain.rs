//! Louvain modularity optimization
//!
//! Weighted single-level node-moving phase: every node starts in its own
//! community; each pass tries moving each node into the neighboring
//! community with the best modularity gain, until a full pass changes
//! nothing or the iteration cap is reached. Ties break toward the smaller
//! community id so runs are deterministic.

use crate::graph::GraphSnapshot;
use std::collections::HashMap;
use tagmine_core::PointId;

pub fn detect_communities(snapshot: &GraphSnapshot, max_iterations: usize) -> Vec<Vec<PointId>> {
    let nodes = snapshot.nodes();
    if nodes.is_empty() {
        return Vec::new();
    }

    // Total edge weight m and weighted degree per node
    let mut degree: HashMap<PointId, f64> = HashMap::with_capacity(nodes.len());
    let mut total_weight = 0.0;
    for node in &nodes {
        let k: f64 = snapshot
            .neighbors(node)
            .map(|n| n.values().sum())
            .unwrap_or(0.0);
        degree.insert(*node, k);
        total_weight += k;
    }
    let m = total_weight / 2.0;
    if m <= 0.0 {
        // No edges: every node is its own community
        return nodes.into_iter().map(|n| vec![n]).collect();
    }

    // Community id = the smallest node id it currently contains
    let mut community: HashMap<PointId, PointId> =
        nodes.iter().map(|n| (*n, *n)).collect();
    let mut community_degree: HashMap<PointId, f64> =
        nodes.iter().map(|n| (*n, degree[n])).collect();

    for _ in 0..max_iterations {
        let mut improved = false;
        for node in &nodes {
            let current = community[node];
            let k_node = degree[node];

            // Weight from this node into each neighboring community
            let mut weight_to: HashMap<PointId, f64> = HashMap::new();
            if let Some(neighbors) = snapshot.neighbors(node) {
                for (neighbor, weight) in neighbors {
                    *weight_to.entry(community[neighbor]).or_insert(0.0) += weight;
                }
            }

            // Take the node out of its community while evaluating moves
            *community_degree.entry(current).or_insert(0.0) -= k_node;

            let gain = |target: &PointId| {
                let w_ic = weight_to.get(target).copied().unwrap_or(0.0);
                let sum_tot = community_degree.get(target).copied().unwrap_or(0.0);
                w_ic - sum_tot * k_node / (2.0 * m)
            };

            let mut best_community = current;
            let mut best_gain = gain(&current);
            let mut candidates: Vec<PointId> = weight_to.keys().copied().collect();
            candidates.sort();
            for candidate in candidates {
                let candidate_gain = gain(&candidate);
                let wins = candidate_gain > best_gain + f64::EPSILON
                    || ((candidate_gain - best_gain).abs() <= f64::EPSILON
                        && candidate < best_community);
                if wins {
                    best_gain = candidate_gain;
                    best_community = candidate;
                }
            }

            *community_degree.entry(best_community).or_insert(0.0) += k_node;
            if best_community != current {
                community.insert(*node, best_community);
                improved = true;
            }
        }
        if !improved {
            break;
        }
    }

    let mut grouped: HashMap<PointId, Vec<PointId>> = HashMap::new();
    for (node, comm) in community {
        grouped.entry(comm).or_default().push(node);
    }
    let mut communities: Vec<Vec<PointId>> = grouped
        .into_values()
        .map(|mut members| {
            members.sort();
            members
        })
        .collect();
    communities.sort_by(|a, b| a[0].cmp(&b[0]));
    communities
}
