use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use trawl_core::error::AppError;
use trawl_core::models::{CacheEntry, HeaderMap, NewCacheEntry, RequestDescriptor, ResponseBody};
use trawl_core::traits::RequestCache;

use crate::config::{CacheConfig, CacheLocation};

/// SQLite-backed request cache.
///
/// Rows are append-only: expired entries stay on disk and simply stop
/// matching. Cloning shares the pool, so one store can serve several
/// engines and sandbox sessions.
#[derive(Clone)]
pub struct SqliteRequestCache {
    pool: SqlitePool,
}

impl SqliteRequestCache {
    /// Open the pool described by `config`, creating the database file and
    /// its parent folder when missing.
    pub async fn connect(config: &CacheConfig) -> Result<Self, AppError> {
        let (options, pool_options) = match &config.location {
            CacheLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal);
                (options, SqlitePoolOptions::new())
            }
            CacheLocation::Memory => {
                let options = SqliteConnectOptions::from_str("sqlite::memory:")
                    .map_err(|e| AppError::DatabaseError(e.to_string()))?;
                // Losing the last connection loses the data.
                let pool_options = SqlitePoolOptions::new()
                    .min_connections(1)
                    .idle_timeout(None::<Duration>)
                    .max_lifetime(None::<Duration>);
                (options, pool_options)
            }
        };

        let pool = pool_options
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::debug!(location = ?config.location, "Request cache opened");
        Ok(Self { pool })
    }

    /// Connect and run migrations.
    pub async fn open(config: &CacheConfig) -> Result<Self, AppError> {
        let cache = Self::connect(config).await?;
        cache.migrate().await?;
        Ok(cache)
    }

    /// Create a cache from an existing pool (useful for testing).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct CacheRow {
    id: i64,
    request: String,
    response_status: i64,
    response_headers: String,
    response_body: Option<Vec<u8>>,
    response_body_filepath: Option<String>,
    expires_on: Option<i64>,
    created_at: i64,
}

impl TryFrom<CacheRow> for CacheEntry {
    type Error = AppError;

    fn try_from(row: CacheRow) -> Result<Self, Self::Error> {
        let response_headers: HeaderMap = serde_json::from_str(&row.response_headers)?;
        let status = u16::try_from(row.response_status).map_err(|_| {
            AppError::DatabaseError(format!(
                "Row {} has invalid status {}",
                row.id, row.response_status
            ))
        })?;
        let body = match (row.response_body_filepath, row.response_body) {
            (Some(path), _) => ResponseBody::File(PathBuf::from(path)),
            (None, body) => ResponseBody::Bytes(Bytes::from(body.unwrap_or_default())),
        };

        Ok(CacheEntry {
            id: row.id,
            request_key: row.request,
            status,
            response_headers,
            body,
            expires_on: row.expires_on.map(from_millis).transpose()?,
            created_at: from_millis(row.created_at)?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AppError::DatabaseError(format!("Timestamp {ms} is out of range")))
}

impl RequestCache for SqliteRequestCache {
    async fn lookup(
        &self,
        request: &RequestDescriptor,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, AppError> {
        let row = sqlx::query_as::<_, CacheRow>(
            r#"
            SELECT id, request, response_status, response_headers, response_body,
                   response_body_filepath, expires_on, created_at
            FROM requests
            WHERE request = ?1
              AND (expires_on IS NULL OR expires_on >= ?2)
            ORDER BY expires_on IS NULL, expires_on DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(request.canonical_key())
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(CacheEntry::try_from).transpose()
    }

    async fn store(&self, entry: &NewCacheEntry) -> Result<(), AppError> {
        let headers = serde_json::to_string(&entry.response_headers)?;
        let (body, filepath) = match &entry.body {
            ResponseBody::Bytes(bytes) => (Some(bytes.to_vec()), None),
            ResponseBody::File(path) => (None, Some(path.to_string_lossy().into_owned())),
        };

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO requests
                (request, response_status, response_headers, response_body,
                 response_body_filepath, expires_on, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&entry.request_key)
        .bind(i64::from(entry.status))
        .bind(headers)
        .bind(body)
        .bind(filepath)
        .bind(entry.expires_on.map(|t| t.timestamp_millis()))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            tracing::debug!(status = entry.status, "Cache slot already filled, insert ignored");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AppError> {
        self.pool.close().await;
        Ok(())
    }
}
