//! Benchmark configuration.
//!
//! Built once by the entrypoint and handed to the runner by reference. Nothing
//! in the core reads the environment; see `poolbench-cli` for the layered
//! `.env` / TOML / flag loading.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

use crate::error::{BenchError, Result};

/// Connection descriptor for the PostgreSQL backend
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default, skip_serializing)]
    pub password: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            user: default_user(),
            password: String::new(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ConnectionConfig {
    /// sqlx options for opening a single physical connection
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user);

        if self.password.is_empty() {
            options
        } else {
            options.password(&self.password)
        }
    }

    /// `host:port/database` for log lines (never includes credentials)
    pub fn display_target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Pool sizing and exhaustion behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// How long a worker waits for a handle before failing the item
    #[serde(
        default = "default_acquire_timeout",
        rename = "acquire_timeout_secs",
        with = "duration_secs"
    )]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

/// Workload shape: how many entities and how many concurrent workers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadConfig {
    #[serde(default = "default_entities")]
    pub entities: usize,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            entities: default_entities(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BenchConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub workload: WorkloadConfig,
}

impl BenchConfig {
    /// Reject configurations the harness cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(BenchError::invalid_config("pool max_size must be at least 1"));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(BenchError::invalid_config(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.workload.concurrency == 0 {
            return Err(BenchError::invalid_config("concurrency must be at least 1"));
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_min_size() -> usize {
    1
}

fn default_max_size() -> usize {
    50
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_entities() -> usize {
    1000
}

fn default_concurrency() -> usize {
    50
}

/// Durations are written as (fractional) seconds in config files.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
