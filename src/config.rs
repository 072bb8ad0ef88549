//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connector::AdapterOptions;
use crate::hub::HubConfig;
use crate::transform::TransformLimits;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub connector: ConnectorConfig,

    #[serde(default)]
    pub transform: TransformConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins; empty allows any
    #[serde(default)]
    pub cors_origins: Vec<String>,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ApiConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Fan-out hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Events buffered per subscriber before drops
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_connections() -> usize {
    1000
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl HubSection {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.max_connections,
            channel_capacity: self.channel_capacity,
        }
    }
}

/// Feed connector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Adapter session buffer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ConnectorConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Limits for HTTP transform scripts
#[derive(Debug, Clone, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    #[serde(default = "default_transform_timeout")]
    pub timeout_ms: u64,
}

fn default_max_steps() -> u64 {
    100_000
}

fn default_transform_timeout() -> u64 {
    250
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            timeout_ms: default_transform_timeout(),
        }
    }
}

/// Catalog store configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// JSON catalog loaded at startup; empty store when unset
    pub catalog: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("feedhub").join("config.toml")),
            Some(PathBuf::from("/etc/feedhub/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Options shared by every protocol adapter
    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            channel_capacity: self.connector.channel_capacity,
            connect_timeout: Duration::from_secs(self.connector.connect_timeout_secs),
            transform_limits: TransformLimits {
                max_steps: self.transform.max_steps,
                timeout: Duration::from_millis(self.transform.timeout_ms),
            },
        }
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("FEEDHUB_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = var("FEEDHUB_API_PORT").and_then(|p| p.parse().ok()) {
            self.api.port = port;
        }

        if let Some(catalog) = var("FEEDHUB_CATALOG") {
            self.store.catalog = Some(catalog);
        }

        if let Some(secs) = var("FEEDHUB_PROBE_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.connector.probe_timeout_secs = secs;
        }

        if let Some(level) = var("FEEDHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("FEEDHUB_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Feedhub Configuration
#
# Environment variables override these settings:
# - FEEDHUB_API_HOST
# - FEEDHUB_API_PORT
# - FEEDHUB_CATALOG
# - FEEDHUB_PROBE_TIMEOUT_SECS
# - FEEDHUB_LOG_LEVEL
# - FEEDHUB_LOG_FORMAT

[api]
# API server host
host = "0.0.0.0"

# API server port
port = 8090

# Allowed CORS origins (empty allows any)
cors_origins = []

# Maximum request body size (bytes)
max_body_bytes = 2097152

[hub]
# Maximum concurrently connected subscriber streams
max_connections = 1000

# Events buffered per subscriber; a full buffer drops that subscriber's events
channel_capacity = 256

[connector]
# Deadline for connection tests (seconds)
probe_timeout_secs = 10

# Deadline for WebSocket connect and upgrade (seconds)
connect_timeout_secs = 10

# Events buffered between an adapter and its runner
channel_capacity = 256

[transform]
# Step budget per transform run
max_steps = 100000

# Wall-clock deadline per transform run (ms)
timeout_ms = 250

[store]
# JSON catalog of feeds, filters and subscription filters
# catalog = "/etc/feedhub/catalog.json"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.addr(), "0.0.0.0:8090");
        assert_eq!(config.connector.probe_timeout(), Duration::from_secs(10));
        assert_eq!(config.hub.hub_config().channel_capacity, 256);
        assert!(config.store.catalog.is_none());
        assert!(!config.logging.is_json());
    }

    #[test]
    fn test_generated_config_parses_to_defaults() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.api.port, 8090);
        assert_eq!(config.transform.max_steps, 100_000);
        assert_eq!(config.hub.max_connections, 1000);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[api]\nport = 9000\n\n[transform]\ntimeout_ms = 50").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.host, "0.0.0.0");

        let options = config.adapter_options();
        assert_eq!(options.transform_limits.timeout, Duration::from_millis(50));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/feedhub.toml")),
            Err(ConfigError::Io { .. })
        ));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[api]\nport = \"not a port\"").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FEEDHUB_API_PORT", "7001"),
            ("FEEDHUB_CATALOG", "/tmp/catalog.json"),
            ("FEEDHUB_PROBE_TIMEOUT_SECS", "3"),
            ("FEEDHUB_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.api.port, 7001);
        assert_eq!(config.store.catalog.as_deref(), Some("/tmp/catalog.json"));
        assert_eq!(config.connector.probe_timeout_secs, 3);
        assert!(config.logging.is_json());
    }
}
