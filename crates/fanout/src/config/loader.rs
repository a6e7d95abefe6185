use std::path::Path;

use crate::config::schema::{EngineConfig, CONFIG_VERSION};
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.version != CONFIG_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    if config.completion.max_tokens == 0 {
        return Err(ConfigError::Validation {
            message: "completion.max_tokens must be at least 1".to_string(),
        });
    }

    if config.completion.timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "completion.timeout_secs must be at least 1".to_string(),
        });
    }

    if !config.completion.base_url.starts_with("http://")
        && !config.completion.base_url.starts_with("https://")
    {
        return Err(ConfigError::Validation {
            message: format!(
                "completion.base_url must be an http(s) URL: {}",
                config.completion.base_url
            ),
        });
    }

    if config.sweeper.enabled && config.sweeper.interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "sweeper.interval_secs must be at least 1".to_string(),
        });
    }

    if config.sweeper.batch_limit == 0 {
        return Err(ConfigError::Validation {
            message: "sweeper.batch_limit must be at least 1".to_string(),
        });
    }

    if config.unit_lease() <= config.completion.timeout() {
        return Err(ConfigError::Validation {
            message: "leases.unit_lease_secs must exceed completion.timeout_secs".to_string(),
        });
    }

    Ok(())
}
