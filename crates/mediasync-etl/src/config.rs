//! Configuration management
//!
//! Built once at process start from `.env_etl`, `.env` and the process
//! environment, then handed to each component constructor.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::Watermark;
use crate::packager::{Representation, StreamFormat};
use crate::retry::{self, RetryPolicy};
use crate::state::{self, parse_timestamp};

// ============================================================================
// Defaults
// ============================================================================

/// Default database host.
pub const DEFAULT_DB_HOST: &str = "127.0.0.1";

/// Default database port.
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default maximum database connections in the pool.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Default database connection timeout in seconds.
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default search engine host.
pub const DEFAULT_ELASTIC_HOST: &str = "localhost";

/// Default search engine port.
pub const DEFAULT_ELASTIC_PORT: u16 = 9200;

/// Default search engine request timeout in seconds.
pub const DEFAULT_ELASTIC_TIMEOUT_SECS: u64 = 30;

/// Fallback page size when none is configured.
pub const DEFAULT_PACK_SIZE: i64 = 5;

/// Earliest watermark, used when no checkpoint exists yet.
pub const DEFAULT_SMALLEST_TIME: &str = "0001-01-01 00:00:00.448000 +00:00";

/// Default search index.
pub const DEFAULT_INDEX_NAME: &str = "videos";

/// Default pause between full scans in seconds.
pub const DEFAULT_IDLE_SECS: u64 = 10;

/// Default checkpoint file.
pub const DEFAULT_STATE_FILE: &str = "state.json";

/// Default number of concurrent packaging jobs.
pub const DEFAULT_PACKAGING_MAX_CONCURRENT: usize = 2;

/// Top-level ETL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub database: DatabaseConfig,
    pub elastic: ElasticConfig,
    pub sync: SyncConfig,
    pub state: StateConfig,
    pub retry: RetryPolicy,
    pub packaging: PackagingConfig,
}

/// Relational source connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Search engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

/// Sync loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Rows per extracted page
    pub pack_size: i64,
    /// Watermark used when no checkpoint exists
    pub smallest_time: Watermark,
    pub index_name: String,
    /// Pause between scans once a pass comes back empty
    pub idle_secs: u64,
    /// Refuse to start from `smallest_time` when the checkpoint is missing
    pub require_checkpoint: bool,
}

/// Which checkpoint backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Json,
    Postgres,
}

impl std::str::FromStr for StateBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" | "file" => Ok(StateBackend::Json),
            "postgres" | "postgresql" | "db" => Ok(StateBackend::Postgres),
            _ => Err(anyhow::anyhow!("Invalid STATE_BACKEND: {}. Must be 'json' or 'postgres'", s)),
        }
    }
}

/// Checkpoint storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub backend: StateBackend,
    pub file: PathBuf,
    pub table: String,
}

/// Media packaging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagingConfig {
    pub enabled: bool,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Root that asset references in the database are relative to
    pub media_root: PathBuf,
    /// Where intermediate containers are written
    pub container_dir: PathBuf,
    /// Where manifests and segments are written, one directory per video
    pub streams_dir: PathBuf,
    pub max_concurrent: usize,
    pub format: StreamFormat,
    /// Fixed renditions; probed from the source when empty
    pub representations: Vec<Representation>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} must be set", key))
}

impl EtlConfig {
    /// Load configuration from `.env_etl`, `.env` and the environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::from_filename(".env_etl").ok();
        dotenvy::dotenv().ok();

        Self::from_env()
    }

    /// Load configuration from an explicit dotenv file, then the environment
    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        dotenvy::from_path(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

        Self::from_env()
    }

    /// Build configuration from process environment only
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            database: DatabaseConfig::from_env()?,
            elastic: ElasticConfig {
                host: env_string("ELASTIC_HOST", DEFAULT_ELASTIC_HOST),
                port: env_or("ELASTIC_PORT", DEFAULT_ELASTIC_PORT),
                timeout_secs: env_or("ELASTIC_TIMEOUT", DEFAULT_ELASTIC_TIMEOUT_SECS),
            },
            sync: SyncConfig::from_env()?,
            state: StateConfig {
                backend: match std::env::var("STATE_BACKEND") {
                    Ok(s) => s.parse()?,
                    Err(_) => StateBackend::default(),
                },
                file: PathBuf::from(env_string("STATE_FILE", DEFAULT_STATE_FILE)),
                table: env_string("STATE_TABLE", state::DEFAULT_STATE_TABLE),
            },
            retry: RetryPolicy {
                max_attempts: env_or("RETRY_MAX_ATTEMPTS", retry::DEFAULT_MAX_ATTEMPTS),
                initial_delay: Duration::from_millis(env_or(
                    "RETRY_INITIAL_DELAY_MS",
                    retry::DEFAULT_INITIAL_DELAY_MS,
                )),
                max_delay: Duration::from_millis(env_or(
                    "RETRY_MAX_DELAY_MS",
                    retry::DEFAULT_MAX_DELAY_MS,
                )),
                factor: env_or("RETRY_FACTOR", retry::DEFAULT_FACTOR),
            },
            packaging: PackagingConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.dbname.is_empty() {
            anyhow::bail!("DB_NAME cannot be empty");
        }
        if self.database.port == 0 || self.elastic.port == 0 {
            anyhow::bail!("Ports must be greater than 0");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be greater than 0");
        }
        if self.sync.pack_size <= 0 {
            anyhow::bail!("ETL_PACK_SIZE must be greater than 0, got {}", self.sync.pack_size);
        }
        if self.sync.index_name.is_empty() {
            anyhow::bail!("ETL_INDEX_NAME cannot be empty");
        }
        if self.sync.index_name != self.sync.index_name.to_lowercase() {
            anyhow::bail!("ETL_INDEX_NAME must be lowercase, got {}", self.sync.index_name);
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if self.retry.initial_delay > self.retry.max_delay {
            anyhow::bail!(
                "RETRY_INITIAL_DELAY_MS ({:?}) cannot exceed RETRY_MAX_DELAY_MS ({:?})",
                self.retry.initial_delay,
                self.retry.max_delay
            );
        }
        if self.state.backend == StateBackend::Json && self.state.file.as_os_str().is_empty() {
            anyhow::bail!("STATE_FILE cannot be empty with the json backend");
        }
        if self.packaging.enabled && self.packaging.max_concurrent == 0 {
            anyhow::bail!("PACKAGING_MAX_CONCURRENT must be greater than 0");
        }
        Ok(())
    }
}

impl DatabaseConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env_string("DB_HOST", DEFAULT_DB_HOST),
            port: env_or("DB_PORT", DEFAULT_DB_PORT),
            dbname: env_required("DB_NAME")?,
            user: env_required("DB_USER")?,
            password: env_required("DB_PASSWORD")?,
            max_connections: env_or("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT", DEFAULT_DB_CONNECT_TIMEOUT_SECS),
        })
    }

    /// Connection options for sqlx; avoids URL-escaping the password.
    pub fn connect_options(&self) -> sqlx::postgres::PgConnectOptions {
        sqlx::postgres::PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.user)
            .password(&self.password)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ElasticConfig {
    /// Base URL of the search engine, e.g. `http://localhost:9200`
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SyncConfig {
    fn from_env() -> anyhow::Result<Self> {
        let smallest_time = env_string("ETL_SMALLEST_TIME", DEFAULT_SMALLEST_TIME);
        let smallest_time = parse_timestamp(&smallest_time)
            .ok_or_else(|| anyhow::anyhow!("ETL_SMALLEST_TIME is not a timestamp: {}", smallest_time))?;

        Ok(Self {
            pack_size: env_or("ETL_PACK_SIZE", DEFAULT_PACK_SIZE),
            smallest_time,
            index_name: env_string("ETL_INDEX_NAME", DEFAULT_INDEX_NAME),
            idle_secs: env_or("ETL_IDLE_SECS", DEFAULT_IDLE_SECS),
            require_checkpoint: env_or("ETL_REQUIRE_CHECKPOINT", false),
        })
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pack_size: DEFAULT_PACK_SIZE,
            smallest_time: parse_timestamp(DEFAULT_SMALLEST_TIME).unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC),
            index_name: DEFAULT_INDEX_NAME.to_string(),
            idle_secs: DEFAULT_IDLE_SECS,
            require_checkpoint: false,
        }
    }
}

impl PackagingConfig {
    fn from_env() -> anyhow::Result<Self> {
        let media_root = PathBuf::from(env_string("MEDIA_ROOT", "media"));
        let format = match std::env::var("PACKAGING_FORMAT") {
            Ok(s) => s.parse()?,
            Err(_) => StreamFormat::default(),
        };
        let representations = match std::env::var("PACKAGING_REPRESENTATIONS") {
            Ok(s) => Representation::parse_list(&s)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            enabled: env_or("PACKAGING_ENABLED", true),
            ffmpeg_path: env_string("FFMPEG_PATH", "ffmpeg"),
            ffprobe_path: env_string("FFPROBE_PATH", "ffprobe"),
            container_dir: std::env::var("CONTAINER_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| media_root.join("containers")),
            streams_dir: PathBuf::from(env_string("STREAMS_DIR", "streams")),
            media_root,
            max_concurrent: env_or("PACKAGING_MAX_CONCURRENT", DEFAULT_PACKAGING_MAX_CONCURRENT),
            format,
            representations,
        })
    }
}

impl Default for PackagingConfig {
    fn default() -> Self {
        let media_root = PathBuf::from("media");
        Self {
            enabled: true,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            container_dir: media_root.join("containers"),
            streams_dir: PathBuf::from("streams"),
            media_root,
            max_concurrent: DEFAULT_PACKAGING_MAX_CONCURRENT,
            format: StreamFormat::default(),
            representations: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DB_NAME",
        "DB_USER",
        "DB_PASSWORD",
        "DB_PORT",
        "ETL_PACK_SIZE",
        "ETL_SMALLEST_TIME",
        "ETL_INDEX_NAME",
        "STATE_BACKEND",
        "ELASTIC_HOST",
        "ELASTIC_PORT",
        "PACKAGING_REPRESENTATIONS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    fn set_required() {
        std::env::set_var("DB_NAME", "movies");
        std::env::set_var("DB_USER", "app");
        std::env::set_var("DB_PASSWORD", "secret");
    }

    #[test]
    #[serial]
    fn test_defaults_apply_when_only_credentials_given() {
        clear_env();
        set_required();

        let config = EtlConfig::from_env().unwrap();
        assert_eq!(config.database.host, DEFAULT_DB_HOST);
        assert_eq!(config.sync.pack_size, DEFAULT_PACK_SIZE);
        assert_eq!(config.sync.index_name, "videos");
        assert_eq!(config.elastic.address(), "http://localhost:9200");
        assert_eq!(config.state.backend, StateBackend::Json);
        assert_eq!(config.sync.smallest_time, SyncConfig::default().smallest_time);
        assert!(config.packaging.representations.is_empty());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_credentials_fail() {
        clear_env();
        std::env::set_var("DB_NAME", "movies");

        let err = EtlConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DB_USER"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_overrides_and_validation() {
        clear_env();
        set_required();
        std::env::set_var("ETL_PACK_SIZE", "100");
        std::env::set_var("STATE_BACKEND", "postgres");
        std::env::set_var("ELASTIC_HOST", "search");
        std::env::set_var("ELASTIC_PORT", "9201");

        let config = EtlConfig::from_env().unwrap();
        assert_eq!(config.sync.pack_size, 100);
        assert_eq!(config.state.backend, StateBackend::Postgres);
        assert_eq!(config.elastic.address(), "http://search:9201");

        std::env::set_var("ETL_PACK_SIZE", "0");
        assert!(EtlConfig::from_env().is_err());

        std::env::set_var("ETL_PACK_SIZE", "5");
        std::env::set_var("ETL_SMALLEST_TIME", "whenever");
        assert!(EtlConfig::from_env().is_err());

        std::env::remove_var("ETL_SMALLEST_TIME");
        std::env::set_var("ETL_INDEX_NAME", "Videos");
        assert!(EtlConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    fn test_state_backend_from_str() {
        assert_eq!("JSON".parse::<StateBackend>().unwrap(), StateBackend::Json);
        assert_eq!("postgresql".parse::<StateBackend>().unwrap(), StateBackend::Postgres);
        assert!("redis".parse::<StateBackend>().is_err());
    }
}
