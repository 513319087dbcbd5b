// Environment variable override support
//
// Format: TAGMINE_<SECTION>_<KEY>, e.g.
//   TAGMINE_SERVICE_DATA_DIR=/var/lib/tagmine
//   TAGMINE_BEHAVIOR_MIN_SAMPLES_FOR_BEHAVIOR=50
//   TAGMINE_CLUSTERING_CLUSTER_ALGORITHM=dbscan

use crate::schema::{ClusterAlgorithmKind, ConfigError, DropPolicy, TagmineConfig};
use std::env;

/// Apply environment variable overrides to an already-loaded configuration.
/// Environment variables win over file values.
pub fn apply_env_overrides(config: &mut TagmineConfig) -> Result<(), ConfigError> {
    for (key, value) in env::vars() {
        let Some(rest) = key.strip_prefix("TAGMINE_") else {
            continue;
        };
        apply_one(config, &rest.to_lowercase(), &value)?;
    }
    Ok(())
}

fn apply_one(config: &mut TagmineConfig, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "service_data_dir" => config.service.data_dir = value.to_string(),
        "service_partitions" => config.service.partitions = parse(key, value)?,

        "adapter_poll_interval_ms" => config.adapter.poll_interval_ms = parse(key, value)?,
        "adapter_point_filters" => config.adapter.point_filters = value.to_string(),
        "adapter_max_discovered_points" => {
            config.adapter.max_discovered_points = parse(key, value)?
        }
        "adapter_batch_size" => config.adapter.batch_size = parse(key, value)?,
        "adapter_channel_capacity" => config.adapter.channel_capacity = parse(key, value)?,
        "adapter_drop_policy" => {
            config.adapter.drop_policy = match value {
                "oldest" => DropPolicy::Oldest,
                "block" => DropPolicy::Block,
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "invalid drop_policy: {}",
                        other
                    )))
                }
            }
        }

        "ingest_resolution_cache_size" => config.ingest.resolution_cache_size = parse(key, value)?,
        "ingest_retry_ttl_s" => config.ingest.retry_ttl_s = parse(key, value)?,

        "behavior_min_samples_for_behavior" => {
            config.behavior.min_samples_for_behavior = parse(key, value)?
        }
        "behavior_publish_interval_s" => config.behavior.publish_interval_s = parse(key, value)?,
        "behavior_behavior_cache_ttl_h" => {
            config.behavior.behavior_cache_ttl_h = parse(key, value)?
        }
        "behavior_max_points_in_memory" => {
            config.behavior.max_points_in_memory = parse(key, value)?
        }

        "correlation_min_overlap" => config.correlation.min_overlap = parse(key, value)?,
        "correlation_significant_r" => config.correlation.significant_r = parse(key, value)?,
        "correlation_max_ff_ms" => config.correlation.max_ff_ms = parse(key, value)?,
        "correlation_max_lag_steps" => config.correlation.max_lag_steps = parse(key, value)?,

        "clustering_cluster_algorithm" => {
            config.clustering.cluster_algorithm = match value {
                "louvain" => ClusterAlgorithmKind::Louvain,
                "dbscan" => ClusterAlgorithmKind::Dbscan,
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "invalid cluster_algorithm: {}",
                        other
                    )))
                }
            }
        }
        "clustering_min_cluster_size" => config.clustering.min_cluster_size = parse(key, value)?,
        "clustering_max_cluster_size" => config.clustering.max_cluster_size = parse(key, value)?,
        "clustering_min_cohesion" => config.clustering.min_cohesion = parse(key, value)?,
        "clustering_dbscan_eps" => config.clustering.dbscan_eps = parse(key, value)?,
        "clustering_dbscan_min_points" => {
            config.clustering.dbscan_min_points = parse(key, value)?
        }
        "clustering_max_iterations" => config.clustering.max_iterations = parse(key, value)?,
        "clustering_scan_interval_s" => config.clustering.scan_interval_s = parse(key, value)?,
        "clustering_fallback_scan_s" => config.clustering.fallback_scan_s = parse(key, value)?,
        "clustering_cluster_ttl_h" => config.clustering.cluster_ttl_h = parse(key, value)?,

        "matching_w_naming" => config.matching.w_naming = parse(key, value)?,
        "matching_w_correlation" => config.matching.w_correlation = parse(key, value)?,
        "matching_w_range" => config.matching.w_range = parse(key, value)?,
        "matching_w_rate" => config.matching.w_rate = parse(key, value)?,
        "matching_min_role_score" => config.matching.min_role_score = parse(key, value)?,
        "matching_min_overall" => config.matching.min_overall = parse(key, value)?,
        "matching_max_per_cluster" => config.matching.max_per_cluster = parse(key, value)?,
        "matching_suggestion_ttl_h" => config.matching.suggestion_ttl_h = parse(key, value)?,

        "feedback_delta_up" => config.feedback.delta_up = parse(key, value)?,
        "feedback_delta_down" => config.feedback.delta_down = parse(key, value)?,
        "feedback_confidence_floor" => config.feedback.confidence_floor = parse(key, value)?,
        "feedback_initial_pattern_confidence" => {
            config.feedback.initial_pattern_confidence = parse(key, value)?
        }

        // Unknown TAGMINE_* keys are ignored so unrelated tooling can share
        // the prefix
        _ => {}
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("invalid value for {}: {}", key, value)))
}
