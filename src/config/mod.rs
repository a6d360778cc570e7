//! Configuration management module
//!
//! Handles loading, validation, and management of application configuration.
//! API credentials are never stored in the file; they come from
//! `KUSTREAM_API_KEY`, `KUSTREAM_API_SECRET` and `KUSTREAM_API_PASSPHRASE`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::kucoin::credentials::{Credential, CredentialMode, CredentialProvider};
use crate::session::SessionConfig;

pub const API_KEY_ENV: &str = "KUSTREAM_API_KEY";
pub const API_SECRET_ENV: &str = "KUSTREAM_API_SECRET";
pub const API_PASSPHRASE_ENV: &str = "KUSTREAM_API_PASSPHRASE";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Topics subscribed when no --topic is given
    pub topics: Vec<String>,

    /// Logging level
    pub log_level: String,

    /// File-based logging configuration
    pub log: LogConfig,

    /// Streaming session configuration
    pub stream: StreamConfig,

    /// Exchange REST configuration
    pub exchange: ExchangeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Connection setup budget in milliseconds, including the welcome frame
    pub connect_timeout_ms: u64,

    /// Subscribe/unsubscribe ack timeout in milliseconds
    pub request_timeout_ms: u64,

    /// First reconnect delay in milliseconds
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap in milliseconds
    pub reconnect_max_ms: u64,

    /// Randomization factor for reconnect delays (0.0 - 1.0)
    pub reconnect_jitter: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// REST API base URL
    pub rest_url: String,

    /// Sandbox REST API base URL
    pub sandbox_rest_url: String,

    /// Use the sandbox environment
    pub sandbox: bool,

    /// Bootstrap request timeout in seconds
    pub timeout_seconds: u64,

    /// API key version used for signing (1 or 2)
    pub api_key_version: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Write logs to `file_path` in addition to stdout
    pub enabled: bool,

    /// Absolute or relative path to the rolling log file
    pub file_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topics: vec!["/market/ticker:BTC-USDT".to_string()],
            log_level: "info".to_string(),
            log: LogConfig::default(),
            stream: StreamConfig::default(),
            exchange: ExchangeConfig::default(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 5_000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            reconnect_jitter: 0.3,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.kucoin.com".to_string(),
            sandbox_rest_url: "https://openapi-sandbox.kucoin.com".to_string(),
            sandbox: false,
            timeout_seconds: 10,
            api_key_version: 2,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_path: "logs/kustream.log".to_string(),
        }
    }
}

impl ExchangeConfig {
    /// REST base URL for the selected environment
    pub fn active_rest_url(&self) -> &str {
        if self.sandbox {
            &self.sandbox_rest_url
        } else {
            &self.rest_url
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl From<&StreamConfig> for SessionConfig {
    fn from(stream: &StreamConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(stream.connect_timeout_ms),
            request_timeout: Duration::from_millis(stream.request_timeout_ms),
            reconnect_initial: Duration::from_millis(stream.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(stream.reconnect_max_ms),
            reconnect_jitter: stream.reconnect_jitter,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        // KUSTREAM_TOPICS - comma-separated list of topics
        if let Ok(topics) = env::var("KUSTREAM_TOPICS") {
            self.topics = topics
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // KUSTREAM_LOG_LEVEL - logging level
        if let Ok(log_level) = env::var("KUSTREAM_LOG_LEVEL") {
            self.log_level = log_level;
        }

        // KUSTREAM_LOG_FILE_PATH - logging destination file, enables file logging
        if let Ok(file_path) = env::var("KUSTREAM_LOG_FILE_PATH") {
            if !file_path.trim().is_empty() {
                self.log.file_path = file_path;
                self.log.enabled = true;
            }
        }

        // Stream-specific environment variables
        if let Some(value) = parse_env("KUSTREAM_STREAM_CONNECT_TIMEOUT_MS") {
            self.stream.connect_timeout_ms = value;
        }
        if let Some(value) = parse_env("KUSTREAM_STREAM_REQUEST_TIMEOUT_MS") {
            self.stream.request_timeout_ms = value;
        }
        if let Some(value) = parse_env("KUSTREAM_STREAM_RECONNECT_INITIAL_MS") {
            self.stream.reconnect_initial_ms = value;
        }
        if let Some(value) = parse_env("KUSTREAM_STREAM_RECONNECT_MAX_MS") {
            self.stream.reconnect_max_ms = value;
        }
        if let Some(value) = parse_env("KUSTREAM_STREAM_RECONNECT_JITTER") {
            self.stream.reconnect_jitter = value;
        }

        // Exchange-specific environment variables
        if let Ok(rest_url) = env::var("KUSTREAM_EXCHANGE_REST_URL") {
            self.exchange.rest_url = rest_url;
        }
        if let Some(sandbox) = parse_env("KUSTREAM_EXCHANGE_SANDBOX") {
            self.exchange.sandbox = sandbox;
        }
        if let Some(value) = parse_env("KUSTREAM_EXCHANGE_TIMEOUT_SECONDS") {
            self.exchange.timeout_seconds = value;
        }
        if let Some(value) = parse_env("KUSTREAM_EXCHANGE_API_KEY_VERSION") {
            self.exchange.api_key_version = value;
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load_from_file(path).unwrap_or_else(|err| {
            tracing::warn!("Failed to load config: {}, using defaults", err);
            let mut config = Self::default();
            config.apply_env_overrides();
            config
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for topic in &self.topics {
            if !topic.starts_with('/') {
                anyhow::bail!("Invalid topic format: {}", topic);
            }
        }

        if self.stream.connect_timeout_ms == 0 {
            anyhow::bail!("stream.connect_timeout_ms must be greater than 0");
        }

        if self.stream.request_timeout_ms == 0 {
            anyhow::bail!("stream.request_timeout_ms must be greater than 0");
        }

        if self.stream.reconnect_initial_ms == 0 {
            anyhow::bail!("stream.reconnect_initial_ms must be greater than 0");
        }

        if self.stream.reconnect_max_ms < self.stream.reconnect_initial_ms {
            anyhow::bail!("stream.reconnect_max_ms must not be less than reconnect_initial_ms");
        }

        if !(0.0..=1.0).contains(&self.stream.reconnect_jitter) {
            anyhow::bail!("stream.reconnect_jitter must be between 0.0 and 1.0");
        }

        if self.exchange.timeout_seconds == 0 {
            anyhow::bail!("Timeout must be greater than 0");
        }

        if !matches!(self.exchange.api_key_version, 1 | 2) {
            anyhow::bail!(
                "Unsupported API key version: {}",
                self.exchange.api_key_version
            );
        }

        if self.log.enabled && self.log.file_path.trim().is_empty() {
            anyhow::bail!("Log file path must not be empty");
        }

        Ok(())
    }

    /// Session timeouts and reconnect policy
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from(&self.stream)
    }

    /// Display formatted configuration
    pub fn display(&self) -> Result<()> {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(self)?);
        println!("# credentials: {} (from environment)", self.credential_summary());
        Ok(())
    }

    /// Which stream the environment credentials open, without revealing them
    pub fn credential_summary(&self) -> &'static str {
        match self.credential().mode() {
            CredentialMode::Public => "public",
            CredentialMode::Private => "private",
        }
    }

    /// Display configuration management help
    pub fn display_help() -> Result<()> {
        println!("Configuration management commands:");
        println!("  kustream config show    - Show current configuration");
        println!("  kustream config reset   - Write default configuration to the config file");
        Ok(())
    }

    /// Handle configuration command
    pub fn handle_command(
        action: &Option<crate::cli::ConfigAction>,
        config_file: &str,
    ) -> Result<()> {
        match action {
            Some(crate::cli::ConfigAction::Show) => {
                let config = Config::load_or_default(config_file);
                config.display()?;
            }
            Some(crate::cli::ConfigAction::Reset) => {
                let default_config = Config::default();
                default_config.save_to_file(config_file)?;
                println!("Configuration reset: {}", config_file);
                default_config.display()?;
            }
            None => {
                Config::display_help()?;
            }
        }
        Ok(())
    }
}

impl CredentialProvider for Config {
    /// Private credential when all three API variables are set, public otherwise
    fn credential(&self) -> Credential {
        let key = env::var(API_KEY_ENV).ok().filter(|v| !v.is_empty());
        let secret = env::var(API_SECRET_ENV).ok().filter(|v| !v.is_empty());
        let passphrase = env::var(API_PASSPHRASE_ENV).ok().filter(|v| !v.is_empty());

        match (key, secret, passphrase) {
            (Some(key), Some(secret), Some(passphrase)) => {
                Credential::private(key, secret, passphrase)
                    .with_api_version(self.exchange.api_key_version)
            }
            _ => Credential::public(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.topics, vec!["/market/ticker:BTC-USDT"]);
        assert_eq!(config.exchange.active_rest_url(), "https://api.kucoin.com");
    }

    #[test]
    fn test_sandbox_url_selection() {
        let mut config = Config::default();
        config.exchange.sandbox = true;
        assert_eq!(
            config.exchange.active_rest_url(),
            "https://openapi-sandbox.kucoin.com"
        );
    }

    #[test]
    fn test_session_config_conversion() {
        let config = Config::default();
        let session = config.session_config();
        assert_eq!(session.request_timeout, Duration::from_secs(5));
        assert_eq!(session.reconnect_initial, Duration::from_millis(500));
        assert_eq!(session.reconnect_max, Duration::from_secs(30));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.topics = vec!["market/ticker:BTC-USDT".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stream.reconnect_max_ms = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stream.reconnect_jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.exchange.api_key_version = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let content = r#"
            topics = ["/market/match:ETH-USDT"]
            log_level = "debug"

            [log]
            enabled = false
            file_path = "logs/test.log"

            [stream]
            request_timeout_ms = 2000

            [exchange]
            sandbox = true
        "#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.stream.request_timeout_ms, 2000);
        assert_eq!(config.stream.connect_timeout_ms, 10_000);
        assert!(config.exchange.sandbox);
        assert_eq!(config.exchange.api_key_version, 2);
    }

    #[test]
    fn test_file_with_only_stream_section() {
        let config: Config = toml::from_str("[stream]\nreconnect_initial_ms = 250\n").unwrap();
        assert_eq!(config.stream.reconnect_initial_ms, 250);
        assert_eq!(config.topics, Config::default().topics);
        assert_eq!(config.log_level, "info");
        assert!(!config.log.enabled);
        assert_eq!(config.log.file_path, LogConfig::default().file_path);
        assert_eq!(config.exchange.rest_url, "https://api.kucoin.com");
    }

    #[test]
    fn test_log_section_without_path_uses_default() {
        let config: Config = toml::from_str("[log]\nenabled = true\n").unwrap();
        assert!(config.log.enabled);
        assert_eq!(config.log.file_path, LogConfig::default().file_path);
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = Config::default();
        config.topics = vec!["/market/level2:BTC-USDT".to_string()];
        let temp_file = NamedTempFile::new().unwrap();

        // Test save
        config.save_to_file(temp_file.path()).unwrap();

        // Test load
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.topics, loaded_config.topics);
        assert_eq!(
            config.stream.reconnect_max_ms,
            loaded_config.stream.reconnect_max_ms
        );
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "topics = 42").unwrap();

        assert!(Config::load_from_file(temp_file.path()).is_err());
        let config = Config::load_or_default(temp_file.path());
        assert_eq!(config.exchange.rest_url, "https://api.kucoin.com");
    }
}
