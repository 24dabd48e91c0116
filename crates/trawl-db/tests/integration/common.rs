use std::path::Path;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use trawl_core::error::AppError;
use trawl_core::models::{
    HeaderMap, NewCacheEntry, OutboundRequest, RequestDescriptor, ResponseBody,
};
use trawl_core::traits::{HttpClient, HttpResponse};
use trawl_db::{CacheConfig, SqliteRequestCache};

/// Opens a migrated cache in a fresh temporary folder.
///
/// The `TempDir` must be kept in scope for the test duration; dropping it
/// deletes the database file.
pub async fn setup_test_cache() -> (SqliteRequestCache, TempDir) {
    init_tracing();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let cache = open_in(dir.path()).await;
    (cache, dir)
}

pub async fn open_in(folder: &Path) -> SqliteRequestCache {
    SqliteRequestCache::open(&CacheConfig::in_folder(folder))
        .await
        .expect("Failed to open cache")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn bytes_entry(
    descriptor: &RequestDescriptor,
    body: &'static str,
    expires_on: Option<chrono::DateTime<chrono::Utc>>,
) -> NewCacheEntry {
    NewCacheEntry {
        request_key: descriptor.canonical_key(),
        status: 200,
        response_headers: headers(&[("content-type", "text/plain")]),
        body: ResponseBody::Bytes(body.into()),
        expires_on,
    }
}

pub async fn row_count(cache: &SqliteRequestCache) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM requests")
        .fetch_one(cache.pool())
        .await
        .expect("Failed to count rows")
}

/// Serves the same body for every request and counts calls.
#[derive(Clone, Default)]
pub struct CountingClient {
    pub requests: Arc<Mutex<Vec<OutboundRequest>>>,
}

impl CountingClient {
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl HttpClient for CountingClient {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, AppError> {
        let body = format!("body of {}", request.url);
        self.requests.lock().unwrap().push(request);
        Ok(HttpResponse::from_bytes(
            200,
            headers(&[("content-type", "text/plain")]),
            body,
        ))
    }
}
