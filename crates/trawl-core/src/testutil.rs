//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks using `Arc<Mutex<_>>` so tests can script responses
//! and assert on recorded calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::oneshot;

use crate::error::AppError;
use crate::memory_cache::MemoryRequestCache;
use crate::models::{CacheEntry, HeaderMap, NewCacheEntry, OutboundRequest, RequestDescriptor};
use crate::traits::{Clock, HttpClient, HttpResponse, RequestCache};

// ---------------------------------------------------------------------------
// MockHttpClient
// ---------------------------------------------------------------------------

/// A scripted response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl MockResponse {
    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }
}

enum Reply {
    Ready(Result<MockResponse, AppError>),
    /// Held until the test sends the response.
    Gated(oneshot::Receiver<MockResponse>),
}

/// Mock HTTP client. Each call pops the next scripted reply; with none left
/// it fails with a network error.
#[derive(Clone, Default)]
pub struct MockHttpClient {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    requests: Arc<Mutex<Vec<OutboundRequest>>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<MockResponse>) -> Self {
        let client = Self::new();
        for response in responses {
            client.push(response);
        }
        client
    }

    pub fn push(&self, response: MockResponse) {
        self.replies.lock().unwrap().push_back(Reply::Ready(Ok(response)));
    }

    pub fn push_error(&self, error: AppError) {
        self.replies.lock().unwrap().push_back(Reply::Ready(Err(error)));
    }

    /// Script a reply that blocks until the returned sender fires.
    pub fn push_gated(&self) -> oneshot::Sender<MockResponse> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().unwrap().push_back(Reply::Gated(rx));
        tx
    }

    /// Requests sent so far, in call order.
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl HttpClient for MockHttpClient {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, AppError> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);
        let reply = self.replies.lock().unwrap().pop_front();
        let response = match reply {
            Some(Reply::Ready(result)) => result?,
            Some(Reply::Gated(rx)) => rx
                .await
                .map_err(|_| AppError::NetworkError(format!("gate for {url} was dropped")))?,
            None => return Err(AppError::NetworkError(format!("no mock response for {url}"))),
        };
        Ok(HttpResponse::from_bytes(
            response.status,
            response.headers,
            response.body,
        ))
    }
}

// ---------------------------------------------------------------------------
// FailingCache
// ---------------------------------------------------------------------------

/// Cache that always misses and refuses every store.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingCache;

impl RequestCache for FailingCache {
    async fn lookup(
        &self,
        _request: &RequestDescriptor,
        _now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, AppError> {
        Ok(None)
    }

    async fn store(&self, _entry: &NewCacheEntry) -> Result<(), AppError> {
        Err(AppError::DatabaseError("disk full".into()))
    }
}

// ---------------------------------------------------------------------------
// RecordingCache
// ---------------------------------------------------------------------------

/// In-memory cache that counts how often it was closed.
#[derive(Debug, Clone, Default)]
pub struct RecordingCache {
    inner: MemoryRequestCache,
    closes: Arc<AtomicUsize>,
}

impl RecordingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl RequestCache for RecordingCache {
    async fn lookup(
        &self,
        request: &RequestDescriptor,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, AppError> {
        self.inner.lookup(request, now).await
    }

    async fn store(&self, entry: &NewCacheEntry) -> Result<(), AppError> {
        self.inner.store(entry).await
    }

    async fn close(&self) -> Result<(), AppError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
