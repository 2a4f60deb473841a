//! Configuration management for Ratewarden.
//!
//! Configuration is read once at startup: an optional YAML file, then
//! environment variables prefixed with `RATEWARDEN` (`__` separates nested
//! keys, e.g. `RATEWARDEN_STORE__URL`). Nothing here is reloaded at runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WardenError};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Admission behaviour
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Per-policy overrides, keyed by policy name
    #[serde(default)]
    pub policies: HashMap<String, PolicyOverride>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Counter store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix for every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Upper bound on opening a connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Eager connection attempts at startup
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Base delay between startup connection attempts
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Issue the expiry-set off the request path
    #[serde(default = "default_detach_expiry")]
    pub detach_expiry: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            connect_attempts: default_connect_attempts(),
            backoff_base_ms: default_backoff_base(),
            detach_expiry: default_detach_expiry(),
        }
    }
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "rl".to_string()
}

fn default_command_timeout() -> u64 {
    250
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    100
}

fn default_detach_expiry() -> bool {
    true
}

/// What to do with a request when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Forward the request unthrottled
    #[default]
    Open,
    /// Reject the request with 503
    Closed,
}

/// Admission behaviour shared by every guarded route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub fail_mode: FailMode,

    /// Use the first `X-Forwarded-For` address as the caller address.
    /// Only safe behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

/// Override for one policy. Missing fields keep the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub max_requests: Option<u64>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WardenConfig {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| WardenError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();

        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.store.url, "redis://127.0.0.1:6379");
        assert_eq!(config.store.key_prefix, "rl");
        assert!(config.store.command_timeout() < Duration::from_secs(1));
        assert!(config.store.detach_expiry);
        assert_eq!(config.admission.fail_mode, FailMode::Open);
        assert!(!config.admission.trust_forwarded_for);
        assert!(config.policies.is_empty());
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
store:
  url: "redis://cache:6379/2"
  command_timeout_ms: 100
admission:
  fail_mode: closed
  trust_forwarded_for: true
policies:
  auth:
    max_requests: 10
  ai-generation:
    window_ms: 60000
logging:
  format: json
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.store.url, "redis://cache:6379/2");
        assert_eq!(config.store.command_timeout_ms, 100);
        assert_eq!(config.store.connect_timeout_ms, 1000);
        assert_eq!(config.admission.fail_mode, FailMode::Closed);
        assert!(config.admission.trust_forwarded_for);
        assert_eq!(config.policies["auth"].max_requests, Some(10));
        assert_eq!(config.policies["auth"].window_ms, None);
        assert_eq!(config.policies["ai-generation"].window_ms, Some(60000));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = WardenConfig::from_yaml("admission:\n  fail_mode: sideways\n");
        assert!(matches!(result, Err(WardenError::Config(_))));
    }

    /// Tests that read or write `RATEWARDEN_*` variables hold this lock.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    #[test]
    fn test_load_without_file_uses_defaults() {
        let _env = ENV_LOCK.lock();
        let config = WardenConfig::load(None).unwrap();
        assert_eq!(config.store.key_prefix, "rl");
    }

    #[test]
    fn test_load_applies_environment() {
        let _env = ENV_LOCK.lock();
        std::env::set_var("RATEWARDEN_STORE__KEY_PREFIX", "edge");
        std::env::set_var("RATEWARDEN_POLICIES__AI_GENERATION__MAX_REQUESTS", "7");

        let result = WardenConfig::load(None);

        std::env::remove_var("RATEWARDEN_STORE__KEY_PREFIX");
        std::env::remove_var("RATEWARDEN_POLICIES__AI_GENERATION__MAX_REQUESTS");

        let config = result.unwrap();
        assert_eq!(config.store.key_prefix, "edge");
        assert_eq!(config.policies["ai_generation"].max_requests, Some(7));
        assert_eq!(config.policies["ai_generation"].window_ms, None);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = WardenConfig::load(Some(Path::new("/nonexistent/ratewarden.yaml")));
        assert!(matches!(result, Err(WardenError::Config(_))));
    }
}
