//! Configuration management for Ratekeeper.

use redis::ConnectionInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::LimiterConfig;
use crate::storage::RedisStorage;

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limiting quotas
    #[serde(default)]
    pub rate_limiting: LimiterConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,

    /// Upper bound on one rate limit check, in milliseconds
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

impl ServerConfig {
    /// The interceptor's bound on a limiter call.
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_check_timeout_ms() -> u64 {
    5000
}

/// Which storage backend to run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on restart
    Memory,
    /// Shared through a Redis server
    #[default]
    Redis,
}

impl FromStr for StorageBackend {
    type Err = RatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "redis" => Ok(StorageBackend::Redis),
            other => Err(RatekeeperError::Config(format!(
                "unknown storage backend '{}', expected 'memory' or 'redis'",
                other
            ))),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StorageBackend,

    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,

    /// Memory backend sweep period in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            redis: RedisConfig::default(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl StorageConfig {
    /// Memory backend sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub db: i64,

    /// Bound on connecting and the startup `PING`, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: String::new(),
            db: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// Connection parameters for these settings.
    pub fn connection_info(&self) -> ConnectionInfo {
        RedisStorage::connection_info(&self.host, self.port, &self.password, self.db)
    }

    /// Connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_connect_timeout_ms() -> u64 {
    5000
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
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl RatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from the process environment, falling back to the
    /// `KEY=value` pairs in `path` for variables the environment leaves unset.
    pub fn with_env_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let vars = read_env_file(path)?;
        info!(path = %path.display(), variables = vars.len(), "Loaded environment file");

        Ok(self.with_overrides(|name| {
            std::env::var(name)
                .ok()
                .or_else(|| vars.get(name).cloned())
        }))
    }

    /// Apply overrides from `lookup`.
    ///
    /// Recognised variables: `SERVER_PORT`, `REDIS_HOST`, `REDIS_PORT`,
    /// `REDIS_PASSWORD`, `REDIS_DB` and the `RATE_LIMIT_*` quota settings.
    /// Values that fail to parse are ignored with a warning.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = parse_var::<u16, _>("SERVER_PORT", &lookup) {
            self.server.addr.set_port(port);
        }
        if let Some(host) = lookup("REDIS_HOST").filter(|v| !v.is_empty()) {
            self.storage.redis.host = host;
        }
        if let Some(port) = parse_var::<u16, _>("REDIS_PORT", &lookup) {
            self.storage.redis.port = port;
        }
        if let Some(password) = lookup("REDIS_PASSWORD").filter(|v| !v.is_empty()) {
            self.storage.redis.password = password;
        }
        if let Some(db) = parse_var::<i64, _>("REDIS_DB", &lookup) {
            self.storage.redis.db = db;
        }

        self.rate_limiting = self.rate_limiting.with_overrides(&lookup);
        self
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let to_config_error = |e: dotenvy::Error| {
        RatekeeperError::Config(format!("Failed to read {}: {}", path.display(), e))
    };

    dotenvy::from_filename_iter(path)
        .map_err(to_config_error)?
        .map(|item| item.map_err(to_config_error))
        .collect()
}

fn parse_var<T, F>(name: &str, lookup: &F) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name).filter(|v| !v.is_empty())?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(variable = name, value = %raw, error = %e, "Ignoring unparsable setting");
            None
        }
    }
}
