//! Configuration management for market-gate.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `MARKET_GATE__*` environment variables (e.g.
//! `MARKET_GATE__RATE_LIMITING__TRUST_PROXY=true`). The binary applies CLI
//! flags on top.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{GateError, Result};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "MARKET_GATE";

/// Main configuration for the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
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

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Take the client address from `X-Forwarded-For`
    #[serde(default)]
    pub trust_proxy: bool,

    /// Interval between expired-counter sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Path exempt from the general policy
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Per-policy overrides, keyed by policy name
    #[serde(default)]
    pub policies: HashMap<String, PolicyOverride>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            trust_proxy: false,
            sweep_interval_secs: default_sweep_interval(),
            health_path: default_health_path(),
            policies: HashMap::new(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Overrides for one built-in policy. Unset fields keep the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub compensate_on_success: Option<bool>,
    #[serde(default)]
    pub compensate_on_failure: Option<bool>,
}

impl GateConfig {
    /// Load configuration from a YAML file only.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Layer defaults, an optional YAML file and environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|layered| layered.try_deserialize::<GateConfig>())
            .map_err(|e| GateError::Config(e.to_string()))
    }
}
