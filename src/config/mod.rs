//! Configuration Module
//!
//! Provides TOML-based configuration for the bridge gateway with support for:
//! - Logging
//! - Forwarding engine limits
//! - Bridge definitions (local and remote subscriptions)
//! - Environment variable overrides (VIBEMQ_BRIDGE__* prefix)

use std::collections::HashSet;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use bridge::{BridgeConfig, BridgeProtocol, LocalSubscription, RemoteSubscription};
pub use forwarding::ForwardingConfig;

mod bridge;
mod forwarding;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    // The pattern is a literal and always compiles
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Config(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Logging configuration
    pub log: LogConfig,
    /// Forwarding engine configuration
    pub forwarding: ForwardingConfig,
    /// Bridge configurations
    #[serde(default)]
    pub bridge: Vec<BridgeConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or filter directive: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Include thread ids in log lines
    #[serde(default = "default_true")]
    pub thread_ids: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            thread_ids: true,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `VIBEMQ_BRIDGE__` prefix with double underscores for nesting:
    ///    - `VIBEMQ_BRIDGE__LOG__LEVEL=debug` overrides `log.level`
    ///    - `VIBEMQ_BRIDGE__FORWARDING__INFLIGHT_THRESHOLD=128` overrides `forwarding.inflight_threshold`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("log.thread_ids", true)?
            .set_default("forwarding.inflight_threshold", 64)?
            .set_default("forwarding.read_batch_size", 50)?
            .set_default("forwarding.read_batch_bytes", 5 * 1024 * 1024)?
            .set_default("forwarding.max_hops", 1)?
            .set_default("forwarding.buffer_capacity", 1000)?
            .set_default("forwarding.marker_reset_timeout", "30s")?
            .set_default("forwarding.poll_retry_delay", "100ms")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEMQ_BRIDGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: GatewayConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fwd = &self.forwarding;
        if fwd.inflight_threshold == 0 {
            return Err(ConfigError::Validation(
                "forwarding.inflight_threshold must be at least 1".to_string(),
            ));
        }
        if fwd.read_batch_size == 0 {
            return Err(ConfigError::Validation(
                "forwarding.read_batch_size must be at least 1".to_string(),
            ));
        }
        if fwd.buffer_capacity == 0 {
            return Err(ConfigError::Validation(
                "forwarding.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if fwd.max_hops == 0 {
            return Err(ConfigError::Validation(
                "forwarding.max_hops must be at least 1".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for bridge in &self.bridge {
            bridge.validate()?;
            if !ids.insert(bridge.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate bridge id '{}'",
                    bridge.id
                )));
            }
        }

        Ok(())
    }

    /// Bridges that should be running
    pub fn enabled_bridges(&self) -> impl Iterator<Item = &BridgeConfig> {
        self.bridge.iter().filter(|b| b.enabled)
    }
}
