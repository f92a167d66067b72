//! Durable checkpoint storage
//!
//! The sync loop keeps its watermark here so that a restart resumes where
//! the last completed scan left off. Two interchangeable backends exist:
//!
//! - [`JsonFileStorage`]: one JSON object on disk, read-merge-write as a whole
//! - [`PostgresStorage`]: one row per key in a small key/value table
//!
//! Both return an empty checkpoint when nothing has been stored yet, and
//! both fail with [`EtlError::StateCorrupt`] when stored data cannot be
//! read back. Callers decide what "absent" means; this module never invents
//! a value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;

use crate::error::{EtlError, EtlResult};
use crate::models::Watermark;

/// Key under which the sync watermark is stored.
pub const WATERMARK_KEY: &str = "time";

/// Persisted key/value mapping.
pub type Checkpoint = BTreeMap<String, Value>;

/// Backend for checkpoint persistence.
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Merge `state` into the persisted checkpoint.
    async fn save_state(&self, state: &Checkpoint) -> EtlResult<()>;

    /// Load the persisted checkpoint, empty if none exists yet.
    async fn retrieve_state(&self) -> EtlResult<Checkpoint>;
}

#[async_trait]
impl<T: StateStorage + ?Sized> StateStorage for Box<T> {
    async fn save_state(&self, state: &Checkpoint) -> EtlResult<()> {
        (**self).save_state(state).await
    }

    async fn retrieve_state(&self) -> EtlResult<Checkpoint> {
        (**self).retrieve_state().await
    }
}

/// Checkpoint kept in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStorage for JsonFileStorage {
    async fn save_state(&self, state: &Checkpoint) -> EtlResult<()> {
        let mut current = self.retrieve_state().await?;
        current.extend(state.iter().map(|(k, v)| (k.clone(), v.clone())));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename keeps the previous checkpoint intact if we crash mid-write.
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, serde_json::to_vec(&current)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), keys = state.len(), "Checkpoint saved");
        Ok(())
    }

    async fn retrieve_state(&self) -> EtlResult<Checkpoint> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Checkpoint::new()),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes).map_err(|e| {
            EtlError::StateCorrupt(format!("{} is not a JSON object: {}", self.path.display(), e))
        })
    }
}

/// Default table for [`PostgresStorage`].
pub const DEFAULT_STATE_TABLE: &str = "etl_state";

/// Checkpoint kept as one row per key in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    table: String,
}

impl PostgresStorage {
    /// Bind to `table`, creating it if needed.
    ///
    /// The table name is interpolated into SQL, so only identifiers made of
    /// ASCII letters, digits, `_` and a single schema `.` are accepted.
    pub async fn connect(pool: PgPool, table: &str) -> EtlResult<Self> {
        if !is_valid_table_name(table) {
            return Err(EtlError::Config(format!("Invalid state table name: {}", table)));
        }

        let storage = Self {
            pool,
            table: table.to_string(),
        };
        storage.create_table().await?;
        Ok(storage)
    }

    async fn create_table(&self) -> EtlResult<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

fn is_valid_table_name(table: &str) -> bool {
    let parts: Vec<&str> = table.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|p| {
            !p.is_empty()
                && !p.starts_with(|c: char| c.is_ascii_digit())
                && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[async_trait]
impl StateStorage for PostgresStorage {
    async fn save_state(&self, state: &Checkpoint) -> EtlResult<()> {
        let upsert = format!(
            r#"
            INSERT INTO {} (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
            self.table
        );

        let mut tx = self.pool.begin().await?;
        for (key, value) in state {
            sqlx::query(&upsert)
                .bind(key)
                .bind(sqlx::types::Json(value))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn retrieve_state(&self) -> EtlResult<Checkpoint> {
        let select = format!("SELECT key, value FROM {}", self.table);
        let rows: Vec<(String, sqlx::types::Json<Value>)> =
            sqlx::query_as(&select).fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|(k, v)| (k, v.0)).collect())
    }
}

/// Typed access to a checkpoint backend.
pub struct State<S> {
    storage: S,
}

impl<S: StateStorage> State<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub async fn set_state(&self, key: &str, value: Value) -> EtlResult<()> {
        let mut state = Checkpoint::new();
        state.insert(key.to_string(), value);
        self.storage.save_state(&state).await
    }

    pub async fn get_state(&self, key: &str) -> EtlResult<Option<Value>> {
        Ok(self.storage.retrieve_state().await?.remove(key))
    }

    /// Stored watermark, `None` if no scan has completed yet.
    pub async fn watermark(&self) -> EtlResult<Option<Watermark>> {
        match self.get_state(WATERMARK_KEY).await? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => parse_timestamp(&s).map(Some).ok_or_else(|| {
                EtlError::StateCorrupt(format!("{} holds an unreadable timestamp: {}", WATERMARK_KEY, s))
            }),
            Some(other) => Err(EtlError::StateCorrupt(format!(
                "{} holds a non-string value: {}",
                WATERMARK_KEY, other
            ))),
        }
    }

    pub async fn set_watermark(&self, watermark: Watermark) -> EtlResult<()> {
        self.set_state(WATERMARK_KEY, Value::String(watermark.to_rfc3339()))
            .await
    }
}

/// Parse a timestamp in RFC 3339 or the `YYYY-MM-DD HH:MM:SS[.f] ±HH:MM`
/// form PostgreSQL prints.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f %:z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"]
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
        .map(|ts| ts.with_timezone(&Utc))
}
