//! Configuration management for the herald gateway.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding the callback attempt timeout, kept for
/// wire compatibility with existing deployments.
const CALLBACK_TIMEOUT_ENV: &str = "GOOSH_CALLBACK_TIMEOUT";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// The service works out-of-the-box with production-ready defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host")]
    pub host: String,

    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Size of the shared per-device send pool.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Size of the callback delivery pool.
    ///
    /// Environment variable: `CALLBACK_WORKERS`
    #[serde(default = "default_callback_workers")]
    pub callback_workers: usize,

    /// Per-attempt timeout for callback deliveries, in seconds.
    ///
    /// Environment variable: `GOOSH_CALLBACK_TIMEOUT`, applied after the
    /// figment merge so garbage values degrade to the default instead of
    /// failing startup.
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_seconds: u64,

    /// Log level configuration.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `config.toml`, and environment
    /// variable overrides.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let mut config: Self = figment.extract().context("failed to load configuration")?;
        config.apply_callback_timeout_env();
        config.validate()?;
        Ok(config)
    }

    /// Applies the legacy callback-timeout variable, tolerating garbage
    /// the way existing deployments expect: unparseable values fall back
    /// to the current setting with a logged warning.
    fn apply_callback_timeout_env(&mut self) {
        let Ok(value) = std::env::var(CALLBACK_TIMEOUT_ENV) else {
            return;
        };
        match value.trim().parse::<u64>() {
            Ok(seconds) => self.callback_timeout_seconds = seconds,
            Err(_) => warn!(
                value = %value,
                default = self.callback_timeout_seconds,
                "couldn't parse {CALLBACK_TIMEOUT_ENV}, using default instead"
            ),
        }
    }

    /// Callback per-attempt timeout as a duration.
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_seconds)
    }

    /// Parses the server socket address from host and port.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr).context("invalid server address")
    }

    /// Validates configuration values.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }
        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }
        if self.callback_workers == 0 {
            anyhow::bail!("callback_workers must be greater than 0");
        }
        if self.callback_timeout_seconds == 0 {
            anyhow::bail!("callback timeout must be greater than 0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            worker_pool_size: default_worker_pool_size(),
            callback_workers: default_callback_workers(),
            callback_timeout_seconds: default_callback_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_worker_pool_size() -> usize {
    herald_delivery::DEFAULT_WORKER_COUNT
}

fn default_callback_workers() -> usize {
    herald_delivery::DEFAULT_CALLBACK_WORKERS
}

fn default_callback_timeout() -> u64 {
    herald_delivery::DEFAULT_CALLBACK_TIMEOUT_SECONDS
}

fn default_log_level() -> String {
    "info".to_string()
}
