// Configuration loading and management

use crate::env::apply_env_overrides;
use crate::schema::{validate_config, ConfigError, TagmineConfig};
use std::path::Path;

/// Load configuration from an optional file and the environment.
///
/// Loading hierarchy: env > file > defaults
pub fn load_config(path: Option<&Path>) -> Result<TagmineConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_from_file(path)?,
        None => TagmineConfig::default(),
    };

    apply_env_overrides(&mut config)?;
    validate_config(&config)?;

    Ok(config)
}

/// Load configuration from a TOML file
pub fn load_from_file(path: &Path) -> Result<TagmineConfig, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    load_from_str(&content)
}

/// Parse configuration from TOML text
pub fn load_from_str(content: &str) -> Result<TagmineConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}
