use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};

use crate::error::AppError;
use crate::models::{CacheEntry, HeaderMap, NewCacheEntry, OutboundRequest, RequestDescriptor};

/// A response body delivered chunk by chunk.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>>;

/// A network response whose body has not been consumed yet.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl HttpResponse {
    /// A response whose whole body is already in memory.
    pub fn from_bytes(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers,
            body: Box::pin(futures::stream::once(async move { Ok(body) })),
        }
    }

    /// Drain the body stream into memory.
    pub async fn bytes(self) -> Result<Bytes, AppError> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs the actual network call for a request.
pub trait HttpClient: Send + Sync + Clone + 'static {
    fn send(
        &self,
        request: OutboundRequest,
    ) -> impl Future<Output = Result<HttpResponse, AppError>> + Send;
}

/// Persistent store mapping canonical request descriptors to responses.
///
/// Stores are append-only. Writing a body file is the caller's job; the
/// cache only records its path.
pub trait RequestCache: Send + Sync + Clone + 'static {
    /// Return the newest entry for `request` that is valid at `now`.
    ///
    /// Expired rows behave as a miss and are left in place.
    fn lookup(
        &self,
        request: &RequestDescriptor,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<CacheEntry>, AppError>> + Send;

    fn store(&self, entry: &NewCacheEntry) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Release the underlying store handle.
    fn close(&self) -> impl Future<Output = Result<(), AppError>> + Send {
        async { Ok(()) }
    }
}

/// A cache that never hits, for runs that should not persist anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

impl RequestCache for NullCache {
    async fn lookup(
        &self,
        _request: &RequestDescriptor,
        _now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, AppError> {
        Ok(None)
    }

    async fn store(&self, _entry: &NewCacheEntry) -> Result<(), AppError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Type-erased handles
// ---------------------------------------------------------------------------

trait ErasedHttpClient: Send + Sync {
    fn send_boxed(&self, request: OutboundRequest) -> BoxFuture<'_, Result<HttpResponse, AppError>>;
}

impl<H: HttpClient> ErasedHttpClient for H {
    fn send_boxed(
        &self,
        request: OutboundRequest,
    ) -> BoxFuture<'_, Result<HttpResponse, AppError>> {
        Box::pin(self.send(request))
    }
}

/// An [`HttpClient`] with its concrete type erased, so sandbox sessions
/// can hold whatever transport the controller was built with.
#[derive(Clone)]
pub struct DynHttpClient(Arc<dyn ErasedHttpClient>);

impl DynHttpClient {
    pub fn new<H: HttpClient>(client: H) -> Self {
        Self(Arc::new(client))
    }
}

impl HttpClient for DynHttpClient {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, AppError> {
        self.0.send_boxed(request).await
    }
}

trait ErasedRequestCache: Send + Sync {
    fn lookup_boxed<'a>(
        &'a self,
        request: &'a RequestDescriptor,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, AppError>>;

    fn store_boxed<'a>(&'a self, entry: &'a NewCacheEntry) -> BoxFuture<'a, Result<(), AppError>>;

    fn close_boxed(&self) -> BoxFuture<'_, Result<(), AppError>>;
}

impl<S: RequestCache> ErasedRequestCache for S {
    fn lookup_boxed<'a>(
        &'a self,
        request: &'a RequestDescriptor,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, AppError>> {
        Box::pin(self.lookup(request, now))
    }

    fn store_boxed<'a>(&'a self, entry: &'a NewCacheEntry) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(self.store(entry))
    }

    fn close_boxed(&self) -> BoxFuture<'_, Result<(), AppError>> {
        Box::pin(self.close())
    }
}

/// A [`RequestCache`] with its concrete type erased. Clones share the
/// same underlying store.
#[derive(Clone)]
pub struct DynRequestCache(Arc<dyn ErasedRequestCache>);

impl DynRequestCache {
    pub fn new<S: RequestCache>(cache: S) -> Self {
        Self(Arc::new(cache))
    }
}

impl RequestCache for DynRequestCache {
    async fn lookup(
        &self,
        request: &RequestDescriptor,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, AppError> {
        self.0.lookup_boxed(request, now).await
    }

    async fn store(&self, entry: &NewCacheEntry) -> Result<(), AppError> {
        self.0.store_boxed(entry).await
    }

    async fn close(&self) -> Result<(), AppError> {
        self.0.close_boxed().await
    }
}

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_bytes_round_trips_body() {
        let response = HttpResponse::from_bytes(200, HeaderMap::new(), "hello");
        assert_eq!(response.bytes().await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn stream_errors_surface_from_bytes() {
        let response = HttpResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Box::pin(futures::stream::iter(vec![
                Ok(Bytes::from("part")),
                Err(AppError::NetworkError("reset".into())),
            ])),
        };
        assert!(matches!(
            response.bytes().await,
            Err(AppError::NetworkError(_))
        ));
    }

    #[tokio::test]
    async fn null_cache_never_hits() {
        let cache = NullCache;
        let request = RequestDescriptor::get("https://example.com");
        assert!(cache.lookup(&request, Utc::now()).await.unwrap().is_none());
    }
}
