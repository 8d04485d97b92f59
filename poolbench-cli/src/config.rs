//! Layered configuration for the `poolbench` binary.
//!
//! Precedence (highest to lowest): command-line flag, environment variable
//! (including values loaded from `.env`), TOML file, built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use poolbench_core::BenchConfig;
use tracing::debug;

/// Load environment variables from .env files
///
/// Priority order (highest to lowest):
/// 1. Environment variables already set
/// 2. Current directory .env
/// 3. ~/.poolbench/.env
///
/// Called before the tracing subscriber is installed, so `RUST_LOG` may come
/// from a `.env`. Returns the files it loaded for the caller to log.
pub fn load_dotenv() -> Vec<PathBuf> {
    let mut loaded_from = Vec::new();

    if let Ok(path) = dotenvy::dotenv() {
        loaded_from.push(path);
    }

    if let Some(env_file) = config_dir().map(|dir| dir.join(".env")) {
        // dotenvy doesn't overwrite existing vars
        if env_file.exists() && dotenvy::from_path(&env_file).is_ok() {
            loaded_from.push(env_file);
        }
    }

    loaded_from
}

/// ~/.poolbench
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".poolbench"))
}

/// Read the TOML layer.
///
/// An explicit `--config` path must exist and parse. Otherwise the first of
/// `./poolbench.toml` and `~/.poolbench/config.toml` that exists is used, and
/// with neither present the defaults apply.
pub fn load_file_config(explicit: Option<&Path>) -> Result<BenchConfig> {
    if let Some(path) = explicit {
        return read_config(path);
    }

    let candidates = std::iter::once(PathBuf::from("poolbench.toml"))
        .chain(config_dir().map(|dir| dir.join("config.toml")));
    for path in candidates {
        if path.exists() {
            return read_config(&path);
        }
    }

    debug!("No config file found, using defaults");
    Ok(BenchConfig::default())
}

fn read_config(path: &Path) -> Result<BenchConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Connection flags; each falls back to the environment variable it names.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Database host
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Database port
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Database name
    #[arg(long, env = "DB_NAME")]
    pub database: Option<String>,

    /// Database user
    #[arg(long, env = "USER_NAME")]
    pub user: Option<String>,

    /// Database password
    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

/// Workload and pool sizing flags
#[derive(Args, Debug, Clone, Default)]
pub struct TuningArgs {
    /// Number of entities per run (one CRUD cycle each)
    #[arg(long, short = 'n')]
    pub entities: Option<usize>,

    /// Concurrent workers per phase
    #[arg(long, short = 'c')]
    pub concurrency: Option<usize>,

    /// Connections opened when the pool starts
    #[arg(long)]
    pub min_pool: Option<usize>,

    /// Upper bound on pooled connections
    #[arg(long)]
    pub max_pool: Option<usize>,

    /// Seconds a worker waits for a pooled connection before the item fails
    #[arg(long, value_name = "SECONDS")]
    pub acquire_timeout: Option<f64>,
}

/// Overlay flag/env values onto the file layer and validate the result.
pub fn resolve(
    mut config: BenchConfig,
    connection: &ConnectionArgs,
    tuning: &TuningArgs,
) -> Result<BenchConfig> {
    let target = &mut config.connection;
    if let Some(host) = &connection.host {
        target.host = host.clone();
    }
    if let Some(port) = connection.port {
        target.port = port;
    }
    if let Some(database) = &connection.database {
        target.database = database.clone();
    }
    if let Some(user) = &connection.user {
        target.user = user.clone();
    }
    if let Some(password) = &connection.password {
        target.password = password.clone();
    }

    if let Some(entities) = tuning.entities {
        config.workload.entities = entities;
    }
    if let Some(concurrency) = tuning.concurrency {
        config.workload.concurrency = concurrency;
    }
    if let Some(min_size) = tuning.min_pool {
        config.pool.min_size = min_size;
    }
    if let Some(max_size) = tuning.max_pool {
        config.pool.max_size = max_size;
    }
    if let Some(secs) = tuning.acquire_timeout {
        config.pool.acquire_timeout = Duration::try_from_secs_f64(secs)
            .map_err(|_| anyhow!("--acquire-timeout must be a non-negative number of seconds, got {secs}"))?;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_flags_override_file() {
        let mut file = BenchConfig::default();
        file.connection.host = "db.internal".to_string();
        file.workload.entities = 10;
        file.pool.max_size = 8;

        let connection = ConnectionArgs {
            host: Some("localhost".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        let tuning = TuningArgs {
            concurrency: Some(4),
            acquire_timeout: Some(0.5),
            ..Default::default()
        };

        let config = resolve(file, &connection, &tuning).unwrap();
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.password, "secret");
        assert_eq!(config.workload.entities, 10);
        assert_eq!(config.workload.concurrency, 4);
        assert_eq!(config.pool.max_size, 8);
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_result_is_rejected() {
        let tuning = TuningArgs {
            min_pool: Some(10),
            max_pool: Some(2),
            ..Default::default()
        };
        let err = resolve(BenchConfig::default(), &ConnectionArgs::default(), &tuning).unwrap_err();
        assert!(format!("{err:#}").contains("min_size"));
    }

    #[test]
    fn test_negative_timeout_is_rejected() {
        let tuning = TuningArgs {
            acquire_timeout: Some(-1.0),
            ..Default::default()
        };
        assert!(resolve(BenchConfig::default(), &ConnectionArgs::default(), &tuning).is_err());
    }

    #[test]
    fn test_explicit_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[workload]\nentities = 25\n\n[pool]\nmax_size = 5\nacquire_timeout_secs = 2"
        )
        .unwrap();

        let config = load_file_config(Some(file.path())).unwrap();
        assert_eq!(config.workload.entities, 25);
        assert_eq!(config.workload.concurrency, 50);
        assert_eq!(config.pool.max_size, 5);
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.connection.port, 5432);
    }

    #[test]
    fn test_missing_explicit_config_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_file_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_malformed_config_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[workload]\nentities = \"many\"").unwrap();
        assert!(load_file_config(Some(file.path())).is_err());
    }
}
