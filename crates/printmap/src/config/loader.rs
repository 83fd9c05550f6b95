use std::collections::HashSet;
use std::path::Path;

use crate::analyzer::{MAX_DPI, MIN_DPI};
use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub const SUPPORTED_VERSION: &str = "1.0";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != SUPPORTED_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker.concurrency == 0 {
        return Err(ConfigError::Validation {
            message: "worker.concurrency must be at least 1".to_string(),
        });
    }

    if config.queue.attempts == 0 {
        return Err(ConfigError::Validation {
            message: "queue.attempts must be at least 1".to_string(),
        });
    }

    if !(MIN_DPI..=MAX_DPI).contains(&config.analyzer.dpi) {
        return Err(ConfigError::Validation {
            message: format!(
                "analyzer.dpi must be between {} and {}, got {}",
                MIN_DPI, MAX_DPI, config.analyzer.dpi
            ),
        });
    }

    // One layer may block on two renders between heartbeats.
    let render_window = config.analyzer.render_timeout_secs.saturating_mul(2);
    if render_window >= config.queue.stall_interval_secs {
        return Err(ConfigError::Validation {
            message: format!(
                "queue.stall_interval_secs ({}) must exceed twice analyzer.render_timeout_secs ({})",
                config.queue.stall_interval_secs, config.analyzer.render_timeout_secs
            ),
        });
    }

    if let Some(table) = &config.analyzer.effects {
        table.validate()?;

        let mut seen = HashSet::new();
        for rule in &table.rules {
            for keyword in &rule.keywords {
                if !seen.insert(keyword.to_lowercase()) {
                    return Err(ConfigError::InvalidEffectRule {
                        effect: rule.effect.to_string(),
                        reason: format!("keyword '{}' is claimed by more than one rule", keyword),
                    });
                }
            }
        }
    }

    Ok(())
}
