//! Persistent cache mapping request fingerprints to submitted batches.
//!
//! The cache is the bridge between process runs: a rerun of a script whose
//! batch is still cooking looks its requests up here and re-attaches to the
//! provider batch instead of submitting again. One SQLite table, stored
//! under the user cache directory.

use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache database location.
pub const CACHE_PATH_ENV_VAR: &str = "BATCHLING_CACHE_PATH";

/// Rows older than this are never returned as hits and are pruned on write.
pub const CACHE_RETENTION_DAYS: i64 = 30;

/// Cache row used to resume batch polling from an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CacheEntry {
    /// Stable fingerprint for a request
    pub request_hash: String,
    /// Provider adapter name
    pub provider: String,
    /// Provider endpoint path
    pub endpoint: String,
    /// Model key derived from queue partitioning
    pub model: String,
    /// Provider host used for polling
    pub host: String,
    /// Provider batch identifier
    pub batch_id: String,
    /// Request identifier within the provider batch
    pub custom_id: String,
    /// When the cache row was created
    pub created_at: DateTime<Utc>,
}

/// Resolve the cache database path.
///
/// Precedence: explicit path, then `BATCHLING_CACHE_PATH`, then
/// `~/.cache/batchling/cache.sqlite3`.
pub fn resolve_cache_path(path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = std::env::var(CACHE_PATH_ENV_VAR)
        && !env_path.is_empty()
    {
        return Ok(PathBuf::from(env_path));
    }
    let home = std::env::var("HOME")
        .map_err(|_| anyhow::anyhow!("cannot resolve cache path: HOME is not set"))?;
    Ok(PathBuf::from(home)
        .join(".cache")
        .join("batchling")
        .join("cache.sqlite3"))
}

/// SQLite-backed persistent request cache.
#[derive(Debug, Clone)]
pub struct RequestCacheStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl RequestCacheStore {
    /// Open (or create) the cache database at the resolved path.
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        let path = resolve_cache_path(path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("failed to create cache directory: {e}"))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            path: Some(path),
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Open an in-memory cache, used in tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;
        let store = Self { pool, path: None };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// The underlying database path (`None` for in-memory stores).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_cache (
                request_hash TEXT PRIMARY KEY,
                provider     TEXT NOT NULL,
                endpoint     TEXT NOT NULL,
                model        TEXT NOT NULL,
                host         TEXT NOT NULL,
                batch_id     TEXT NOT NULL,
                custom_id    TEXT NOT NULL,
                created_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_request_cache_created_at
            ON request_cache (created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load one non-expired cache row by request hash.
    pub async fn get_by_hash(&self, request_hash: &str) -> Result<Option<CacheEntry>> {
        let cutoff = Utc::now() - ChronoDuration::days(CACHE_RETENTION_DAYS);
        let row = sqlx::query_as::<_, CacheEntry>(
            r#"
            SELECT request_hash, provider, endpoint, model, host, batch_id, custom_id, created_at
            FROM request_cache
            WHERE request_hash = ? AND created_at > ?
            "#,
        )
        .bind(request_hash)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Insert or update cache rows. Returns the number of rows written.
    pub async fn upsert_many(&self, entries: &[CacheEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut affected = 0;
        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO request_cache (
                    request_hash, provider, endpoint, model, host, batch_id, custom_id, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(request_hash) DO UPDATE SET
                    provider=excluded.provider,
                    endpoint=excluded.endpoint,
                    model=excluded.model,
                    host=excluded.host,
                    batch_id=excluded.batch_id,
                    custom_id=excluded.custom_id,
                    created_at=excluded.created_at
                "#,
            )
            .bind(&entry.request_hash)
            .bind(&entry.provider)
            .bind(&entry.endpoint)
            .bind(&entry.model)
            .bind(&entry.host)
            .bind(&entry.batch_id)
            .bind(&entry.custom_id)
            .bind(entry.created_at)
            .execute(&self.pool)
            .await?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }

    /// Delete rows created before the cutoff. Returns the number deleted.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM request_cache WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete a set of rows by request hash. Returns the number deleted.
    pub async fn delete_by_hashes(&self, request_hashes: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for hash in request_hashes {
            let result = sqlx::query("DELETE FROM request_cache WHERE request_hash = ?")
                .bind(hash)
                .execute(&self.pool)
                .await?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }
}
