//! In-process request cache for ephemeral runs.
//!
//! Same selection rules as the persistent store, but nothing survives the
//! process, so there is no cross-process caching.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{CacheEntry, NewCacheEntry, RequestDescriptor, select_entry};
use crate::traits::RequestCache;

#[derive(Debug, Clone, Default)]
pub struct MemoryRequestCache {
    rows: Arc<Mutex<Vec<CacheEntry>>>,
}

impl MemoryRequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows, expired ones included.
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<CacheEntry>>, AppError> {
        self.rows
            .lock()
            .map_err(|_| AppError::DatabaseError("memory cache lock poisoned".into()))
    }
}

impl RequestCache for MemoryRequestCache {
    async fn lookup(
        &self,
        request: &RequestDescriptor,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, AppError> {
        let key = request.canonical_key();
        let rows = self.lock()?;
        Ok(select_entry(rows.iter().filter(|row| row.request_key == key), now).cloned())
    }

    async fn store(&self, entry: &NewCacheEntry) -> Result<(), AppError> {
        let mut rows = self.lock()?;
        // (request, expires_on) is unique; a second insert is a no-op.
        let exists = rows
            .iter()
            .any(|row| row.request_key == entry.request_key && row.expires_on == entry.expires_on);
        if exists {
            return Ok(());
        }
        let id = rows.len() as i64 + 1;
        rows.push(CacheEntry {
            id,
            request_key: entry.request_key.clone(),
            status: entry.status,
            response_headers: entry.response_headers.clone(),
            body: entry.body.clone(),
            expires_on: entry.expires_on,
            created_at: Utc::now(),
        });
        Ok(())
    }
}
