// Integration tests for configuration loading, validation and credentials

use futures_exec_engine::config::{ConfigError, Credentials, EngineConfig, ExchangeConfig, API_KEY_ENV, API_SECRET_ENV};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_config_file_round_trip() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("engine.toml");

    let mut config = EngineConfig::default();
    config.risk.stop_loss_pct = 0.02;
    config.risk.trailing_pct = 0.01;
    config.feed.shard_size = 20;
    config.telemetry.snapshot_path = Some("results/live_exec/snapshot.json".to_string());

    config.to_file(&config_path).expect("Failed to save config");
    let loaded = EngineConfig::from_file(&config_path).expect("Failed to load config");

    assert_eq!(loaded, config);
}

#[test]
fn test_sections_are_optional() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("engine.toml");
    fs::write(
        &config_path,
        "[execution]\ncooldown_ms = 2000\n\n[exchange]\nrest_url = \"https://testnet.binancefuture.com\"\n",
    )
    .expect("Failed to write config");

    let config = EngineConfig::from_file(&config_path).expect("Failed to load config");

    assert_eq!(config.execution.cooldown_ms, 2_000);
    assert_eq!(config.execution.max_attempts, 4);
    assert_eq!(config.exchange.rest_url, "https://testnet.binancefuture.com");
    assert_eq!(config.exchange.ws_url, "wss://fstream.binance.com");
    assert_eq!(config.feed.heartbeat_ms, 5_000);
    assert_eq!(config.feed.ping_interval_ms, 20_000);
    assert_eq!(config.execution.max_retry_after_ms, 5_000);
}

#[test]
fn test_invalid_values_fail_validation() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("engine.toml");

    for content in [
        "[feed]\nshard_size = 0\n",
        "[risk]\nstop_loss_pct = -0.1\n",
        "[execution]\nmax_attempts = 0\n",
        "[telemetry]\nui_rows = 5\n",
        "[feed]\nreconnect_backoff_ms = 5000\nreconnect_backoff_max_ms = 1000\n",
        "[feed]\nconnect_timeout_ms = 0\n",
        "[feed]\npong_timeout_ms = 0\n",
    ] {
        fs::write(&config_path, content).expect("Failed to write config");
        let result = EngineConfig::from_file(&config_path);
        assert!(
            matches!(result, Err(ConfigError::Validation(_))),
            "expected validation error for {:?}",
            content
        );
    }
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("engine.toml");
    fs::write(&config_path, "[risk\nstop_loss_pct = ").expect("Failed to write config");

    assert!(matches!(EngineConfig::from_file(&config_path), Err(ConfigError::Parse(_))));
}

#[test]
fn test_load_or_default_without_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let missing = temp_dir.path().join("missing.toml");

    assert_eq!(EngineConfig::load_or_default(None).unwrap(), EngineConfig::default());
    assert_eq!(EngineConfig::load_or_default(Some(&missing)).unwrap(), EngineConfig::default());
}

#[test]
fn test_risk_section_builds_thresholds() {
    let config: EngineConfig =
        toml::from_str("[risk]\nstop_loss_pct = 0.02\ntake_profit_pct = 0.05\n").expect("Failed to parse");
    let thresholds = config.risk.thresholds();

    assert_eq!(thresholds.stop_loss, Some(0.02));
    assert_eq!(thresholds.take_profit, Some(0.05));
    assert_eq!(thresholds.trailing, None);
}

fn clear_credential_env() {
    env::remove_var(API_KEY_ENV);
    env::remove_var(API_SECRET_ENV);
}

#[test]
#[serial]
fn test_credentials_prefer_environment() {
    clear_credential_env();
    env::set_var(API_KEY_ENV, "env-key");
    env::set_var(API_SECRET_ENV, "env-secret");

    let exchange = ExchangeConfig {
        api_key: Some("file-key".to_string()),
        api_secret: Some("file-secret".to_string()),
        ..ExchangeConfig::default()
    };
    let credentials = Credentials::resolve(&exchange).expect("Credentials should resolve");
    clear_credential_env();

    assert_eq!(credentials, Credentials::new("env-key", "env-secret"));
}

#[test]
#[serial]
fn test_credentials_fall_back_to_config() {
    clear_credential_env();
    env::set_var(API_KEY_ENV, "env-key-only");

    let exchange = ExchangeConfig {
        api_key: Some("file-key".to_string()),
        api_secret: Some("file-secret".to_string()),
        ..ExchangeConfig::default()
    };
    let credentials = Credentials::resolve(&exchange).expect("Credentials should resolve");
    clear_credential_env();

    assert_eq!(credentials, Credentials::new("file-key", "file-secret"));
}

#[test]
#[serial]
fn test_blank_credentials_are_missing() {
    clear_credential_env();
    env::set_var(API_KEY_ENV, "   ");
    env::set_var(API_SECRET_ENV, "secret");

    let exchange = ExchangeConfig {
        api_key: Some("key".to_string()),
        api_secret: Some("".to_string()),
        ..ExchangeConfig::default()
    };
    let credentials = Credentials::resolve(&exchange);
    clear_credential_env();

    assert!(credentials.is_none());
}
