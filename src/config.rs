// Configuration management for the execution engine

use crate::clients::binance_ws::StreamLiveness;
use crate::core::risk::ExitThresholds;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const API_KEY_ENV: &str = "BINANCE_API_KEY";
pub const API_SECRET_ENV: &str = "BINANCE_API_SECRET";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub exchange: ExchangeConfig,
    pub feed: FeedConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub engine: LoopConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_url: String,
    pub ws_url: String,
    pub request_timeout_ms: u64,
    /// Timeout for the REST price fallback
    pub price_timeout_ms: u64,
    pub recv_window_ms: u64,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://fapi.binance.com".to_string(),
            ws_url: "wss://fstream.binance.com".to_string(),
            request_timeout_ms: 10_000,
            price_timeout_ms: 3_000,
            recv_window_ms: 5_000,
            api_key: None,
            api_secret: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub shard_size: usize,
    /// A price older than this is refreshed over REST
    pub heartbeat_ms: u64,
    pub reconnect_backoff_ms: u64,
    /// Raise above `reconnect_backoff_ms` to back off exponentially
    pub reconnect_backoff_max_ms: u64,
    pub reconnect_jitter: f64,
    pub connect_timeout_ms: u64,
    /// Silence after which the client pings the server
    pub ping_interval_ms: u64,
    /// Silence after a ping before the connection counts as dead
    pub pong_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            shard_size: 50,
            heartbeat_ms: 5_000,
            reconnect_backoff_ms: 1_000,
            reconnect_backoff_max_ms: 1_000,
            reconnect_jitter: 0.1,
            connect_timeout_ms: 10_000,
            ping_interval_ms: 20_000,
            pong_timeout_ms: 10_000,
        }
    }
}

/// Exit thresholds as fractions (0.02 = 2%). Zero disables a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trailing_pct: f64,
}

impl RiskConfig {
    pub fn thresholds(&self) -> ExitThresholds {
        ExitThresholds::from_fractions(self.stop_loss_pct, self.take_profit_pct, self.trailing_pct)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub cooldown_ms: u64,
    pub max_attempts: u32,
    /// Wait between an order and the position re-read
    pub settle_ms: u64,
    pub retry_backoff_ms: u64,
    pub flat_epsilon: f64,
    pub rules_ttl_secs: u64,
    /// Longest exchange back-off request honoured inside one close; longer ones end the close
    pub max_retry_after_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 1_200,
            max_attempts: 4,
            settle_ms: 300,
            retry_backoff_ms: 100,
            flat_epsilon: 1e-12,
            rules_ttl_secs: 3_600,
            max_retry_after_ms: 5_000,
        }
    }
}

impl ExecutionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn rules_ttl(&self) -> Duration {
        Duration::from_secs(self.rules_ttl_secs)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_millis(self.max_retry_after_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub tick_ms: u64,
    pub ledger_refresh_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            ledger_refresh_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub ui_rows: usize,
    pub event_history: usize,
    pub summary_interval_secs: u64,
    pub snapshot_path: Option<String>,
    pub snapshot_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            ui_rows: 25,
            event_history: 20,
            summary_interval_secs: 30,
            snapshot_path: None,
            snapshot_interval_ms: 1_000,
        }
    }
}

impl FeedConfig {
    pub fn liveness(&self) -> StreamLiveness {
        StreamLiveness {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
        }
    }
}

pub const MIN_UI_ROWS: usize = 10;

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("{}: {}", path.as_ref().display(), e)))?;

        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load the given file, or fall back to defaults when no path is given
    /// or the file does not exist yet.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => Self::from_file(path),
            Some(path) => {
                info!("📁 Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchange.rest_url.is_empty() || self.exchange.ws_url.is_empty() {
            return Err(ConfigError::Validation("exchange urls must not be empty".to_string()));
        }

        if self.exchange.request_timeout_ms == 0 || self.exchange.price_timeout_ms == 0 {
            return Err(ConfigError::Validation("request timeouts must be greater than 0".to_string()));
        }

        if self.feed.shard_size == 0 {
            return Err(ConfigError::Validation("shard_size must be greater than 0".to_string()));
        }

        if self.feed.reconnect_backoff_max_ms < self.feed.reconnect_backoff_ms
            || !(0.0..1.0).contains(&self.feed.reconnect_jitter)
        {
            return Err(ConfigError::Validation(
                "reconnect backoff max must cover the base and jitter must be in [0, 1)".to_string(),
            ));
        }

        if self.feed.connect_timeout_ms == 0 || self.feed.ping_interval_ms == 0 || self.feed.pong_timeout_ms == 0 {
            return Err(ConfigError::Validation("stream timeouts must be greater than 0".to_string()));
        }

        if self.feed.heartbeat_ms == 0 {
            return Err(ConfigError::Validation("heartbeat_ms must be greater than 0".to_string()));
        }

        for (name, value) in [
            ("stop_loss_pct", self.risk.stop_loss_pct),
            ("take_profit_pct", self.risk.take_profit_pct),
            ("trailing_pct", self.risk.trailing_pct),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Validation(format!("{} must be a non-negative fraction", name)));
            }
        }

        if self.execution.max_attempts == 0 {
            return Err(ConfigError::Validation("max_attempts must be at least 1".to_string()));
        }

        if !(self.execution.flat_epsilon > 0.0) {
            return Err(ConfigError::Validation("flat_epsilon must be positive".to_string()));
        }

        if self.engine.tick_ms == 0 {
            return Err(ConfigError::Validation("tick_ms must be greater than 0".to_string()));
        }

        if self.telemetry.ui_rows < MIN_UI_ROWS {
            return Err(ConfigError::Validation(format!("ui_rows must be at least {}", MIN_UI_ROWS)));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// API key pair used to sign trading requests
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Environment first, then the `[exchange]` section. Blank values count as missing.
    pub fn resolve(exchange: &ExchangeConfig) -> Option<Self> {
        let from_env = (
            std::env::var(API_KEY_ENV).ok().and_then(non_blank),
            std::env::var(API_SECRET_ENV).ok().and_then(non_blank),
        );
        if let (Some(key), Some(secret)) = from_env {
            return Some(Self::new(key, secret));
        }

        let from_file = (
            exchange.api_key.clone().and_then(non_blank),
            exchange.api_secret.clone().and_then(non_blank),
        );
        match from_file {
            (Some(key), Some(secret)) => Some(Self::new(key, secret)),
            _ => None,
        }
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.api_key.chars().take(4).collect();
        f.debug_struct("Credentials")
            .field("api_key", &format!("{}…", shown))
            .field("api_secret", &"<redacted>")
            .finish()
    }
}
