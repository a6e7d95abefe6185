//! Table-driven tests for engine configuration loading and validation.

use std::path::PathBuf;

use fanout::config::{load_config, load_config_from_str};
use fanout::LogFormat;

/// A single config loading case.
struct ConfigTestCase {
    name: &'static str,
    config_json: &'static str,
    should_succeed: bool,
    /// Expected error substring when loading fails.
    expected_error: Option<&'static str>,
}

const CONFIG_TESTS: &[ConfigTestCase] = &[
    ConfigTestCase {
        name: "valid_minimal",
        config_json: r#"{ "version": "1.0" }"#,
        should_succeed: true,
        expected_error: None,
    },
    ConfigTestCase {
        name: "valid_inline_key_and_json_logs",
        config_json: r#"{
            "version": "1.0",
            "log_format": "json",
            "completion": { "api_key": "sk-test", "base_url": "http://localhost:8080/v1" }
        }"#,
        should_succeed: true,
        expected_error: None,
    },
    ConfigTestCase {
        name: "valid_sweeper_disabled_without_interval",
        config_json: r#"{
            "version": "1.0",
            "sweeper": { "enabled": false, "interval_secs": 0 }
        }"#,
        should_succeed: true,
        expected_error: None,
    },
    ConfigTestCase {
        name: "invalid_version",
        config_json: r#"{ "version": "2.0" }"#,
        should_succeed: false,
        expected_error: Some("Unsupported config version"),
    },
    ConfigTestCase {
        name: "invalid_missing_version",
        config_json: r#"{ "worker_count": 2 }"#,
        should_succeed: false,
        expected_error: Some("version"),
    },
    ConfigTestCase {
        name: "invalid_zero_workers",
        config_json: r#"{ "version": "1.0", "worker_count": 0 }"#,
        should_succeed: false,
        expected_error: Some("worker_count"),
    },
    ConfigTestCase {
        name: "invalid_zero_max_tokens",
        config_json: r#"{ "version": "1.0", "completion": { "max_tokens": 0 } }"#,
        should_succeed: false,
        expected_error: Some("max_tokens"),
    },
    ConfigTestCase {
        name: "invalid_base_url",
        config_json: r#"{ "version": "1.0", "completion": { "base_url": "ftp://example.com" } }"#,
        should_succeed: false,
        expected_error: Some("base_url"),
    },
    ConfigTestCase {
        name: "invalid_unit_lease_not_above_timeout",
        config_json: r#"{
            "version": "1.0",
            "completion": { "timeout_secs": 120 },
            "leases": { "unit_lease_secs": 60 }
        }"#,
        should_succeed: false,
        expected_error: Some("unit_lease_secs"),
    },
    ConfigTestCase {
        name: "invalid_zero_batch_limit",
        config_json: r#"{ "version": "1.0", "sweeper": { "batch_limit": 0 } }"#,
        should_succeed: false,
        expected_error: Some("batch_limit"),
    },
    ConfigTestCase {
        name: "invalid_log_format",
        config_json: r#"{ "version": "1.0", "log_format": "xml" }"#,
        should_succeed: false,
        expected_error: None,
    },
];

#[test]
fn test_config_loading() {
    for test_case in CONFIG_TESTS {
        let result = load_config_from_str(test_case.config_json);

        if test_case.should_succeed {
            assert!(
                result.is_ok(),
                "Test '{}': Expected success but got error: {:?}",
                test_case.name,
                result.err()
            );
        } else {
            assert!(
                result.is_err(),
                "Test '{}': Expected error but got success",
                test_case.name
            );

            if let Some(expected_error) = test_case.expected_error {
                let error_msg = result.err().unwrap().to_string();
                assert!(
                    error_msg.contains(expected_error),
                    "Test '{}': Expected error containing '{}', got '{}'",
                    test_case.name,
                    expected_error,
                    error_msg
                );
            }
        }
    }
}

#[test]
fn test_example_config_loads() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fanout.example.json");
    let config = load_config(&path).unwrap();

    assert_eq!(config.worker_count, 4);
    assert_eq!(config.log_format, LogFormat::Text);
    assert_eq!(
        config.completion.api_key.env_var.as_deref(),
        Some("OPENAI_API_KEY")
    );
    assert!(config.sweeper.enabled);
    assert_eq!(config.splitter.pdf_dpi, 150);
}
