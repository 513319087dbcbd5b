// Configuration schema and types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    ValidationError(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(msg) => write!(f, "config io error: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::ValidationError(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagmineConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding the sled databases (bus log, metadata, series)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Partition count per bus topic; also the worker count per stage
    #[serde(default = "default_partitions")]
    pub partitions: usize,
}

fn default_data_dir() -> String {
    "./tagmine-data".to_string()
}

fn default_partitions() -> usize {
    4
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            partitions: default_partitions(),
        }
    }
}

/// What a full push channel does with new updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Drop the oldest buffered update and count it
    Oldest,
    /// Block the producer until space frees up
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Comma-separated wildcards applied at discovery
    #[serde(default = "default_point_filters")]
    pub point_filters: String,
    #[serde(default = "default_max_discovered_points")]
    pub max_discovered_points: usize,
    /// Upper bound on one poll's emitted batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Push-adapter queue bound
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicy,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_point_filters() -> String {
    "*".to_string()
}

fn default_max_discovered_points() -> usize {
    1000
}

fn default_batch_size() -> usize {
    500
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_drop_policy() -> DropPolicy {
    DropPolicy::Oldest
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            point_filters: default_point_filters(),
            max_discovered_points: default_max_discovered_points(),
            batch_size: default_batch_size(),
            channel_capacity: default_channel_capacity(),
            drop_policy: default_drop_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Capacity of the address-to-sequence-id LRU resolution cache
    #[serde(default = "default_resolution_cache_size")]
    pub resolution_cache_size: usize,
    /// How long an unresolvable sample waits for its point to appear
    /// before being routed to the DLQ
    #[serde(default = "default_retry_ttl_s")]
    pub retry_ttl_s: u64,
}

fn default_resolution_cache_size() -> usize {
    10_000
}

fn default_retry_ttl_s() -> u64 {
    30
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            resolution_cache_size: default_resolution_cache_size(),
            retry_ttl_s: default_retry_ttl_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_min_samples_for_behavior")]
    pub min_samples_for_behavior: u64,
    /// Per-point floor between two published behavior events
    #[serde(default = "default_publish_interval_s")]
    pub publish_interval_s: u64,
    #[serde(default = "default_behavior_cache_ttl_h")]
    pub behavior_cache_ttl_h: u64,
    /// Aggregator capacity before the least-recently-updated 10% is evicted
    #[serde(default = "default_max_points_in_memory")]
    pub max_points_in_memory: usize,
}

fn default_min_samples_for_behavior() -> u64 {
    30
}

fn default_publish_interval_s() -> u64 {
    60
}

fn default_behavior_cache_ttl_h() -> u64 {
    24
}

fn default_max_points_in_memory() -> usize {
    10_000
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            min_samples_for_behavior: default_min_samples_for_behavior(),
            publish_interval_s: default_publish_interval_s(),
            behavior_cache_ttl_h: default_behavior_cache_ttl_h(),
            max_points_in_memory: default_max_points_in_memory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Minimum co-sampled observations for a pair to be considered
    #[serde(default = "default_min_overlap")]
    pub min_overlap: usize,
    /// |r| at or above which a pair is cached and published
    #[serde(default = "default_significant_r")]
    pub significant_r: f64,
    /// Maximum forward-fill staleness when resampling to the coarser grid
    #[serde(default = "default_max_ff_ms")]
    pub max_ff_ms: i64,
    /// Lag search over {-L..+L} steps; 0 disables the search
    #[serde(default)]
    pub max_lag_steps: usize,
}

fn default_min_overlap() -> usize {
    30
}

fn default_significant_r() -> f64 {
    0.7
}

fn default_max_ff_ms() -> i64 {
    5000
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            min_overlap: default_min_overlap(),
            significant_r: default_significant_r(),
            max_ff_ms: default_max_ff_ms(),
            max_lag_steps: 0,
        }
    }
}

/// Community-detection algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterAlgorithmKind {
    Louvain,
    Dbscan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_cluster_algorithm")]
    pub cluster_algorithm: ClusterAlgorithmKind,
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(default = "default_max_cluster_size")]
    pub max_cluster_size: usize,
    /// Minimum mean |r| over intra-cluster edges
    #[serde(default = "default_min_cohesion")]
    pub min_cohesion: f64,
    #[serde(default = "default_dbscan_eps")]
    pub dbscan_eps: f64,
    #[serde(default = "default_dbscan_min_points")]
    pub dbscan_min_points: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Period of the event-driven scan loop
    #[serde(default = "default_scan_interval_s")]
    pub scan_interval_s: u64,
    /// Fallback scheduled scan fires if no scan ran for this long
    #[serde(default = "default_fallback_scan_s")]
    pub fallback_scan_s: u64,
    /// Detected clusters expire after this many hours
    #[serde(default = "default_cluster_ttl_h")]
    pub cluster_ttl_h: u64,
}

fn default_cluster_algorithm() -> ClusterAlgorithmKind {
    ClusterAlgorithmKind::Louvain
}

fn default_min_cluster_size() -> usize {
    3
}

fn default_max_cluster_size() -> usize {
    20
}

fn default_min_cohesion() -> f64 {
    0.5
}

fn default_dbscan_eps() -> f64 {
    0.3
}

fn default_dbscan_min_points() -> usize {
    2
}

fn default_max_iterations() -> usize {
    10
}

fn default_scan_interval_s() -> u64 {
    30
}

fn default_fallback_scan_s() -> u64 {
    300
}

fn default_cluster_ttl_h() -> u64 {
    24
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            cluster_algorithm: default_cluster_algorithm(),
            min_cluster_size: default_min_cluster_size(),
            max_cluster_size: default_max_cluster_size(),
            min_cohesion: default_min_cohesion(),
            dbscan_eps: default_dbscan_eps(),
            dbscan_min_points: default_dbscan_min_points(),
            max_iterations: default_max_iterations(),
            scan_interval_s: default_scan_interval_s(),
            fallback_scan_s: default_fallback_scan_s(),
            cluster_ttl_h: default_cluster_ttl_h(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_w_naming")]
    pub w_naming: f64,
    #[serde(default = "default_w_correlation")]
    pub w_correlation: f64,
    #[serde(default = "default_w_range")]
    pub w_range: f64,
    #[serde(default = "default_w_rate")]
    pub w_rate: f64,
    /// Floor below which a (point, role) pair is never assigned
    #[serde(default = "default_min_role_score")]
    pub min_role_score: f64,
    /// Floor below which a suggestion is not emitted
    #[serde(default = "default_min_overall")]
    pub min_overall: f64,
    #[serde(default = "default_max_per_cluster")]
    pub max_per_cluster: usize,
    /// Pending suggestions expire after this many hours
    #[serde(default = "default_suggestion_ttl_h")]
    pub suggestion_ttl_h: u64,
}

fn default_w_naming() -> f64 {
    0.35
}

fn default_w_correlation() -> f64 {
    0.30
}

fn default_w_range() -> f64 {
    0.20
}

fn default_w_rate() -> f64 {
    0.15
}

fn default_min_role_score() -> f64 {
    0.3
}

fn default_min_overall() -> f64 {
    0.5
}

fn default_max_per_cluster() -> usize {
    3
}

fn default_suggestion_ttl_h() -> u64 {
    72
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            w_naming: default_w_naming(),
            w_correlation: default_w_correlation(),
            w_range: default_w_range(),
            w_rate: default_w_rate(),
            min_role_score: default_min_role_score(),
            min_overall: default_min_overall(),
            max_per_cluster: default_max_per_cluster(),
            suggestion_ttl_h: default_suggestion_ttl_h(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Confidence increment on approval
    #[serde(default = "default_delta_up")]
    pub delta_up: f64,
    /// Confidence decrement on rejection
    #[serde(default = "default_delta_down")]
    pub delta_down: f64,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    #[serde(default = "default_initial_pattern_confidence")]
    pub initial_pattern_confidence: f64,
}

fn default_delta_up() -> f64 {
    0.05
}

fn default_delta_down() -> f64 {
    0.10
}

fn default_confidence_floor() -> f64 {
    0.1
}

fn default_initial_pattern_confidence() -> f64 {
    0.75
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            delta_up: default_delta_up(),
            delta_down: default_delta_down(),
            confidence_floor: default_confidence_floor(),
            initial_pattern_confidence: default_initial_pattern_confidence(),
        }
    }
}

/// Reject configurations that cannot run
pub fn validate_config(config: &TagmineConfig) -> Result<(), ConfigError> {
    if config.service.partitions == 0 {
        return Err(ConfigError::ValidationError(
            "service.partitions must be > 0".to_string(),
        ));
    }
    if config.adapter.batch_size == 0 {
        return Err(ConfigError::ValidationError(
            "adapter.batch_size must be > 0".to_string(),
        ));
    }
    if config.adapter.channel_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "adapter.channel_capacity must be > 0".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.correlation.significant_r) {
        return Err(ConfigError::ValidationError(format!(
            "correlation.significant_r {} outside [0, 1]",
            config.correlation.significant_r
        )));
    }
    if config.clustering.min_cluster_size < 2 {
        return Err(ConfigError::ValidationError(
            "clustering.min_cluster_size must be >= 2".to_string(),
        ));
    }
    if config.clustering.max_cluster_size < config.clustering.min_cluster_size {
        return Err(ConfigError::ValidationError(
            "clustering.max_cluster_size must be >= min_cluster_size".to_string(),
        ));
    }
    let weights = [
        ("matching.w_naming", config.matching.w_naming),
        ("matching.w_correlation", config.matching.w_correlation),
        ("matching.w_range", config.matching.w_range),
        ("matching.w_rate", config.matching.w_rate),
    ];
    for (name, w) in weights {
        if w < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "{} must not be negative",
                name
            )));
        }
    }
    if weights.iter().map(|(_, w)| w).sum::<f64>() <= 0.0 {
        return Err(ConfigError::ValidationError(
            "matching weights must not all be zero".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.feedback.confidence_floor) {
        return Err(ConfigError::ValidationError(format!(
            "feedback.confidence_floor {} outside [0, 1]",
            config.feedback.confidence_floor
        )));
    }
    if config.feedback.initial_pattern_confidence < config.feedback.confidence_floor
        || config.feedback.initial_pattern_confidence > 1.0
    {
        return Err(ConfigError::ValidationError(format!(
            "feedback.initial_pattern_confidence {} outside [floor, 1]",
            config.feedback.initial_pattern_confidence
        )));
    }
    Ok(())
}
