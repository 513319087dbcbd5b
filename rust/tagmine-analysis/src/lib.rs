//! Analysis stages of the pattern flywheel
//!
//! Three interlocked stages: the behavioral aggregator keeps online
//! statistics per point and publishes summaries, the correlation engine
//! pairs co-sampled points, and the cluster detector runs community
//! detection over the resulting correlation graph.

pub mod aggregator;
pub mod clusters;
pub mod correlate;
pub mod dbscan;
pub mod graph;
pub mod louvain;
pub mod ring;
pub mod welford;

pub use aggregator::BehaviorAggregator;
pub use clusters::ClusterDetector;
pub use correlate::CorrelationEngine;
pub use graph::{CorrelationGraph, GraphSnapshot};
pub use ring::SampleRing;
pub use welford::{IntervalReservoir, OnlineStats};
