// tagmine-config - Configuration Management
// TOML-based configuration with environment variable overrides

pub mod config;
pub mod env;
pub mod schema;

pub use config::{load_config, load_from_file, load_from_str};
pub use env::apply_env_overrides;
pub use schema::{
    AdapterConfig, BehaviorConfig, ClusterAlgorithmKind, ClusteringConfig, ConfigError,
    CorrelationConfig, DropPolicy, FeedbackConfig, IngestConfig, MatchingConfig, ServiceConfig,
    TagmineConfig,
};
