//! Table-driven tests for configuration loading and validation.

mod common;

use std::time::Duration;

use printmap::config::{load_config, load_config_from_str};
use printmap::error::ConfigError;

struct ConfigTestCase {
    name: &'static str,
    config_json: &'static str,
    should_succeed: bool,
}

const CONFIG_TESTS: &[ConfigTestCase] = &[
    ConfigTestCase {
        name: "minimal",
        config_json: r#"{ "version": "1.0" }"#,
        should_succeed: true,
    },
    ConfigTestCase {
        name: "missing_version",
        config_json: r#"{ "worker": { "concurrency": 1 } }"#,
        should_succeed: false,
    },
    ConfigTestCase {
        name: "unsupported_version",
        config_json: r#"{ "version": "0.9" }"#,
        should_succeed: false,
    },
    ConfigTestCase {
        name: "dpi_too_low",
        config_json: r#"{ "version": "1.0", "analyzer": { "dpi": 10 } }"#,
        should_succeed: false,
    },
    ConfigTestCase {
        name: "dpi_at_upper_bound",
        config_json: r#"{ "version": "1.0", "analyzer": { "dpi": 1200 } }"#,
        should_succeed: true,
    },
    ConfigTestCase {
        name: "zero_attempts",
        config_json: r#"{ "version": "1.0", "queue": { "attempts": 0 } }"#,
        should_succeed: false,
    },
    ConfigTestCase {
        name: "unknown_effect_type",
        config_json: r#"{ "version": "1.0", "analyzer": { "effects": { "rules": [
            { "effect": "glitter", "keywords": ["glitter"], "defaultSubtype": "fine" }
        ] } } }"#,
        should_succeed: false,
    },
    ConfigTestCase {
        name: "render_timeout_outlasts_stall_interval",
        config_json: r#"{ "version": "1.0", "queue": { "stall_interval_secs": 90 },
            "analyzer": { "render_timeout_secs": 60 } }"#,
        should_succeed: false,
    },
    ConfigTestCase {
        name: "short_stall_interval_with_short_renders",
        config_json: r#"{ "version": "1.0", "queue": { "stall_interval_secs": 30 },
            "analyzer": { "render_timeout_secs": 10 } }"#,
        should_succeed: true,
    },
    ConfigTestCase {
        name: "json_logging",
        config_json: r#"{ "version": "1.0", "logging": { "format": "json" } }"#,
        should_succeed: true,
    },
    ConfigTestCase {
        name: "malformed_json",
        config_json: r#"{ "version": "1.0", "#,
        should_succeed: false,
    },
];

#[test]
fn test_config_table() {
    for case in CONFIG_TESTS {
        let result = load_config_from_str(case.config_json);
        assert_eq!(
            result.is_ok(),
            case.should_succeed,
            "case '{}' returned {:?}",
            case.name,
            result.err()
        );
    }
}

#[test]
fn test_config_file_drives_runtime_settings() {
    let h = common::TestHarness::new();
    let path = h.temp_path().join("printmap.json");
    let db_path = h.temp_path().join("store").join("queue.db");
    let json = serde_json::json!({
        "version": "1.0",
        "queue": { "database_path": db_path, "attempts": 2, "backoff_ms": 250 },
        "worker": { "concurrency": 1, "shutdown_deadline_secs": 3 },
        "storage": { "work_dir": h.work_dir }
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&json).unwrap()).unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.database_path(), db_path);
    assert_eq!(config.work_dir(), h.work_dir);
    assert_eq!(config.job_options().attempts, 2);
    assert_eq!(config.job_options().backoff, Duration::from_millis(250));
    assert_eq!(config.pool_config().drain_deadline, Duration::from_secs(3));
}

#[test]
fn test_schema_errors_are_reported_together() {
    let result = load_config_from_str(
        r#"{ "version": "1.0", "worker": { "concurrency": 0 }, "storage": { "bucket": "x" } }"#,
    );
    match result {
        Err(ConfigError::SchemaValidation { errors }) => assert!(errors.contains(';')),
        other => panic!("expected schema errors, got {:?}", other),
    }
}
