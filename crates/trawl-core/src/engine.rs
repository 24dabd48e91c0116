//! The fetch engine: cache lookup, in-flight deduplication, throttled
//! network calls and response persistence for one logical fetch.
//!
//! ```text
//! fetch ─▶ in-flight? ──yes──▶ await shared result
//!            │no
//!            ▼
//!         cache hit? ──yes──▶ validate ─▶ return
//!            │no
//!            ▼
//!         register in-flight ─▶ RateLimitQueue ─▶ HttpClient
//!                                                  │
//!            store (if accepted) ◀─ read / write ◀─┘
//!            remove in-flight
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;

use crate::error::{AppError, ValidationFailure};
use crate::files;
use crate::models::{
    Cookie, FetchedResponse, HeaderMap, NewCacheEntry, OutboundRequest, RequestDescriptor,
    ResponseBody,
};
use crate::options::{FetchOptions, ResponseMode, StatusPolicy};
use crate::queue::{RateLimitQueue, ThrottleConfig};
use crate::traits::{Clock, HttpClient, RequestCache, SystemClock};

type SharedFetch = Shared<BoxFuture<'static, Result<FetchedResponse, AppError>>>;

enum CacheLookup {
    Hit(FetchedResponse),
    Miss,
    /// A valid entry whose body file has disappeared. Its row still holds
    /// the `(request, expires_on)` slot, so a refetch must restore the file
    /// at this path for the entry to become usable again.
    FileGone(PathBuf),
}

/// Configuration for a [`FetchEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root for written bodies and the temp area.
    pub download_folder: PathBuf,
    pub throttle: ThrottleConfig,
    /// Merged under every request's own headers.
    pub default_headers: HeaderMap,
}

impl EngineConfig {
    pub fn new(download_folder: impl Into<PathBuf>) -> Self {
        Self {
            download_folder: download_folder.into(),
            throttle: ThrottleConfig::default(),
            default_headers: HeaderMap::new(),
        }
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_default_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.default_headers
            .insert(crate::models::normalize_header_name(name), value.into());
        self
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub network_fetches: u64,
    pub cache_hits: u64,
    pub deduplicated: u64,
    pub in_flight: usize,
}

struct EngineInner<H, S> {
    client: H,
    cache: S,
    config: EngineConfig,
    queue: RateLimitQueue,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<HashMap<String, SharedFetch>>,
    network_fetches: AtomicU64,
    cache_hits: AtomicU64,
    deduplicated: AtomicU64,
}

/// Cached, deduplicated, throttled HTTP fetching.
///
/// Each engine owns its own [`RateLimitQueue`] and in-flight map; the
/// request cache may be shared between engines.
pub struct FetchEngine<H, S> {
    inner: Arc<EngineInner<H, S>>,
}

impl<H, S> Clone for FetchEngine<H, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: HttpClient, S: RequestCache> FetchEngine<H, S> {
    pub fn new(client: H, cache: S, config: EngineConfig) -> Result<Self, AppError> {
        Self::with_clock(client, cache, config, Arc::new(SystemClock))
    }

    /// Create an engine whose expiry decisions use `clock`.
    pub fn with_clock(
        client: H,
        cache: S,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let queue = RateLimitQueue::new(config.throttle)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                client,
                cache,
                config,
                queue,
                clock,
                in_flight: Mutex::new(HashMap::new()),
                network_fetches: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                deduplicated: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn download_folder(&self) -> &Path {
        &self.inner.config.download_folder
    }

    pub fn cache(&self) -> &S {
        &self.inner.cache
    }

    pub fn queue(&self) -> &RateLimitQueue {
        &self.inner.queue
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            network_fetches: self.inner.network_fetches.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            deduplicated: self.inner.deduplicated.load(Ordering::Relaxed),
            in_flight: self.inner.lock_in_flight().len(),
        }
    }

    /// Where a write-mode fetch of `request` would put its body, or `None`
    /// in read mode.
    pub fn destination_for(
        &self,
        request: &OutboundRequest,
        options: &FetchOptions,
    ) -> Option<PathBuf> {
        let Some(target) = options.write.as_ref().filter(|_| !options.read) else {
            return None;
        };
        let (_, descriptor) = RequestDescriptor::build(
            request,
            &self.inner.config.default_headers,
            &options.ignore_headers,
        );
        Some(files::destination(
            &self.inner.config.download_folder,
            target,
            options.folder_prefix.as_deref(),
            &descriptor.canonical_key(),
            &descriptor.url,
        ))
    }

    /// Perform one logical fetch.
    ///
    /// 1. Build the descriptor (defaults merged, ignored headers stripped)
    /// 2. Join an identical in-flight fetch, if any
    /// 3. Serve from the cache when a valid entry exists
    /// 4. Otherwise register an in-flight entry and queue the network call
    /// 5. Validate the status against the caller's policy
    /// 6. Hand back the body in the caller's mode (memory or file)
    pub async fn fetch(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, AppError> {
        let request = request.into();
        let mode = options.mode()?;
        let (wire, descriptor) = RequestDescriptor::build(
            &request,
            &self.inner.config.default_headers,
            &options.ignore_headers,
        );
        let key = descriptor.canonical_key();

        let response = if !options.cache {
            let descriptor = descriptor.clone();
            EngineInner::start(&self.inner, key.clone(), wire, descriptor, options, &mode, false)
                .await?
        } else if let Some(shared) = self.inner.joinable(&key) {
            shared.await?
        } else if let CacheLookup::Hit(hit) = self.inner.lookup(&descriptor).await? {
            hit
        } else {
            self.join_or_start(&key, wire, &descriptor, options, &mode).await?
        };

        validate_status(&descriptor, &response, &options.validate_status)?;
        self.inner
            .materialize(response, &mode, options, &key, &descriptor.url)
            .await
    }

    fn join_or_start(
        &self,
        key: &str,
        wire: OutboundRequest,
        descriptor: &RequestDescriptor,
        options: &FetchOptions,
        mode: &ResponseMode,
    ) -> SharedFetch {
        let mut in_flight = self.inner.lock_in_flight();
        if let Some(existing) = in_flight.get(key) {
            self.inner.deduplicated.fetch_add(1, Ordering::Relaxed);
            return existing.clone();
        }
        let shared = EngineInner::start(
            &self.inner,
            key.to_string(),
            wire,
            descriptor.clone(),
            options,
            mode,
            true,
        );
        in_flight.insert(key.to_string(), shared.clone());
        shared
    }

    /// Fetch and read the body into memory.
    pub async fn fetch_bytes(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<Bytes, AppError> {
        let response = self.fetch(request, &options.reading()).await?;
        match response.body {
            ResponseBody::Bytes(bytes) => Ok(bytes),
            ResponseBody::File(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }

    /// Fetch and decode the body as UTF-8 (lossy).
    pub async fn fetch_text(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<String, AppError> {
        let bytes = self.fetch_bytes(request, options).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<T, AppError> {
        let bytes = self.fetch_bytes(request, options).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn fetch_headers(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<HeaderMap, AppError> {
        Ok(self.fetch(request, &options.reading()).await?.headers)
    }

    pub async fn fetch_cookies(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<Vec<Cookie>, AppError> {
        let headers = self.fetch_headers(request, options).await?;
        Ok(Cookie::from_headers(&headers))
    }

    /// Fetch and stream the body to a file, returning its path.
    pub async fn fetch_file(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<PathBuf, AppError> {
        let response = self.fetch(request, &options.writing()).await?;
        response
            .body
            .filepath()
            .cloned()
            .ok_or_else(|| AppError::Generic("write-mode fetch produced no file".into()))
    }

    /// Close the queue (fails if work is pending) and the cache handle.
    pub async fn close(&self) -> Result<(), AppError> {
        self.inner.queue.close()?;
        self.inner.cache.close().await
    }
}

impl<H: HttpClient, S: RequestCache> EngineInner<H, S> {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, SharedFetch>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn joinable(&self, key: &str) -> Option<SharedFetch> {
        let shared = self.lock_in_flight().get(key).cloned();
        if shared.is_some() {
            self.deduplicated.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(request = %key, "Joining in-flight fetch");
        }
        shared
    }

    /// The valid cache entry for `descriptor`, if any.
    async fn lookup(&self, descriptor: &RequestDescriptor) -> Result<CacheLookup, AppError> {
        let Some(entry) = self.cache.lookup(descriptor, self.clock.now()).await? else {
            return Ok(CacheLookup::Miss);
        };
        if let ResponseBody::File(path) = &entry.body
            && !tokio::fs::try_exists(path).await.unwrap_or(false)
        {
            tracing::debug!(path = %path.display(), "Cached body file is gone, refetching");
            return Ok(CacheLookup::FileGone(path.clone()));
        }
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(url = %descriptor.url, status = entry.status, "Cache hit");
        Ok(CacheLookup::Hit(FetchedResponse {
            status: entry.status,
            headers: entry.response_headers,
            body: entry.body,
            from_cache: true,
        }))
    }

    /// Queue the network call now and return its shared, settling future.
    fn start(
        inner: &Arc<Self>,
        key: String,
        wire: OutboundRequest,
        descriptor: RequestDescriptor,
        options: &FetchOptions,
        mode: &ResponseMode,
        registered: bool,
    ) -> SharedFetch {
        let task_inner = Arc::clone(inner);
        let task_key = key.clone();
        let task_options = options.clone();
        let task_mode = mode.clone();
        let queued = inner.queue.enqueue(async move {
            // An identical fetch may have settled and been stored between
            // this caller's lookup and its registration.
            let restore = if task_options.cache {
                match task_inner.lookup(&descriptor).await? {
                    CacheLookup::Hit(hit) => return Ok(hit),
                    CacheLookup::FileGone(path) => Some(path),
                    CacheLookup::Miss => None,
                }
            } else {
                None
            };
            task_inner
                .network_fetch(wire, &task_key, &task_options, &task_mode, restore)
                .await
        });

        let settle_inner = Arc::clone(inner);
        let options = options.clone();
        let shared = async move {
            let result = match queued.await {
                Ok(response) if options.cache => {
                    settle_inner.persist(&key, response, &options).await
                }
                other => other,
            };
            if registered {
                settle_inner.lock_in_flight().remove(&key);
            }
            result
        }
        .boxed()
        .shared();

        // Settle (store, deregister) even if every caller stops waiting.
        tokio::spawn(shared.clone());
        shared
    }

    /// `restore` is the recorded path of a cached body file that went
    /// missing; the body is written back there whatever the caller's mode.
    async fn network_fetch(
        &self,
        wire: OutboundRequest,
        key: &str,
        options: &FetchOptions,
        mode: &ResponseMode,
        restore: Option<PathBuf>,
    ) -> Result<FetchedResponse, AppError> {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(method = %wire.method, url = %wire.url, "Network fetch");
        let url = wire.url.clone();
        let response = self.client.send(wire).await?;
        let status = response.status;
        let headers = response.headers.clone();

        let dest = match (restore, mode) {
            (Some(path), _) => Some(path),
            (None, ResponseMode::Write(target)) => Some(files::destination(
                &self.config.download_folder,
                target,
                options.folder_prefix.as_deref(),
                key,
                &url,
            )),
            (None, ResponseMode::Read) => None,
        };
        let body = match dest {
            // A rejected status never lands at a final path.
            Some(dest) if options.validate_status.accepts(status) => {
                files::write_stream_atomic(&self.config.download_folder, &dest, response.body)
                    .await?;
                ResponseBody::File(dest)
            }
            _ => ResponseBody::Bytes(response.bytes().await?),
        };

        Ok(FetchedResponse {
            status,
            headers,
            body,
            from_cache: false,
        })
    }

    /// Store a fresh response the fetching caller accepts.
    async fn persist(
        &self,
        key: &str,
        response: FetchedResponse,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, AppError> {
        if response.from_cache || !options.validate_status.accepts(response.status) {
            return Ok(response);
        }
        let entry = NewCacheEntry {
            request_key: key.to_string(),
            status: response.status,
            response_headers: response.headers.clone(),
            body: response.body.clone(),
            expires_on: options.expires_on,
        };
        if let Err(e) = self.cache.store(&entry).await {
            tracing::error!(error = %e, "Failed to store response in cache");
            return Err(e);
        }
        Ok(response)
    }

    /// Convert the shared body into the form this caller asked for.
    async fn materialize(
        &self,
        mut response: FetchedResponse,
        mode: &ResponseMode,
        options: &FetchOptions,
        key: &str,
        url: &str,
    ) -> Result<FetchedResponse, AppError> {
        let folder = &self.config.download_folder;
        response.body = match (mode, response.body) {
            (ResponseMode::Read, ResponseBody::File(path)) => {
                ResponseBody::Bytes(Bytes::from(tokio::fs::read(&path).await?))
            }
            (ResponseMode::Read, body) => body,
            (ResponseMode::Write(target), body) => {
                let dest =
                    files::destination(folder, target, options.folder_prefix.as_deref(), key, url);
                match body {
                    ResponseBody::File(path) if path == dest => {}
                    ResponseBody::File(path) => {
                        files::copy_atomic(folder, &path, &dest).await?;
                    }
                    ResponseBody::Bytes(bytes) => {
                        files::write_bytes_atomic(folder, &dest, bytes).await?;
                    }
                }
                ResponseBody::File(dest)
            }
        };
        Ok(response)
    }
}

fn validate_status(
    descriptor: &RequestDescriptor,
    response: &FetchedResponse,
    policy: &StatusPolicy,
) -> Result<(), AppError> {
    if policy.accepts(response.status) {
        return Ok(());
    }
    tracing::warn!(
        url = %descriptor.url,
        status = response.status,
        expected = %policy.describe(),
        "Response status rejected"
    );
    Err(AppError::HttpValidation(Box::new(ValidationFailure {
        request: descriptor.clone(),
        status: response.status,
        response_headers: response.headers.clone(),
        expected: policy.describe(),
    })))
}
