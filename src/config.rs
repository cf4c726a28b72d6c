use crate::backoff::ReconnectPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// WebSocket base URL, e.g. "wss://api.example.com"
    pub ws_base_url: String,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    /// How long a connection with zero subscribers stays open, in milliseconds
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Socket open timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Initial backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Reconnect attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Seen-event window size per session
    #[serde(default = "default_dedup_window")]
    pub window: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: default_dedup_window(),
        }
    }
}

fn default_dedup_window() -> usize {
    1000
}

fn default_grace_period_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FeedConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("reconnect.base_delay_ms", 1000)?
            .set_default("reconnect.max_delay_ms", 30_000)?
            .set_default("reconnect.max_attempts", 5)?
            .set_default("dedup.window", 1000)?
            .set_default("grace_period_ms", 1000)?
            .set_default("connect_timeout_secs", 10)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("LIVEFEED_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (LIVEFEED_RECONNECT__MAX_ATTEMPTS, etc.)
            .add_source(
                Environment::with_prefix("LIVEFEED")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a configuration for a given endpoint with default tuning
    pub fn for_endpoint(ws_base_url: &str) -> Self {
        Self {
            ws_base_url: ws_base_url.to_string(),
            reconnect: ReconnectConfig::default(),
            dedup: DedupConfig::default(),
            grace_period_ms: default_grace_period_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            logging: LoggingConfig::default(),
        }
    }

    /// Reconnection policy derived from this configuration
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect.base_delay_ms),
            cap: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match Url::parse(&self.ws_base_url) {
            Ok(url) => {
                if url.scheme() != "ws" && url.scheme() != "wss" {
                    errors.push(format!(
                        "ws_base_url must use ws:// or wss://, got {}",
                        url.scheme()
                    ));
                }
            }
            Err(e) => errors.push(format!("ws_base_url is not a valid URL: {e}")),
        }

        if self.reconnect.base_delay_ms == 0 {
            errors.push("reconnect.base_delay_ms must be positive".to_string());
        }

        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            errors.push("reconnect.max_delay_ms must not be below base_delay_ms".to_string());
        }

        if self.dedup.window == 0 {
            errors.push("dedup.window must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
