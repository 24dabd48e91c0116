use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::engine::{EngineStats, FetchEngine};
use crate::error::AppError;
use crate::models::{Cookie, FetchedResponse, HeaderMap, OutboundRequest};
use crate::options::FetchOptions;
use crate::sandbox::permissions::{NetPermissions, SandboxFs};
use crate::sandbox::worker::SessionClient;
use crate::traits::DynRequestCache;

pub(crate) type SessionEngine = FetchEngine<SessionClient, DynRequestCache>;

struct ContextInner {
    name: String,
    input: String,
    database_folder: PathBuf,
    fs: SandboxFs,
    net: NetPermissions,
    engine: SessionEngine,
}

/// Everything a scraper entrypoint may touch.
///
/// Fetches are checked against the session's network grant before the
/// cache or the network is consulted, and file destinations must stay
/// inside the session folder.
#[derive(Clone)]
pub struct ScrapeContext {
    inner: Arc<ContextInner>,
}

impl ScrapeContext {
    pub(crate) fn new(
        name: String,
        input: String,
        folder: PathBuf,
        database_folder: PathBuf,
        net: NetPermissions,
        engine: SessionEngine,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name,
                input,
                database_folder,
                fs: SandboxFs::new(folder),
                net,
                engine,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn input(&self) -> &str {
        &self.inner.input
    }

    /// The session folder (read + write).
    pub fn folder(&self) -> &Path {
        self.inner.fs.root()
    }

    pub fn database_folder(&self) -> &Path {
        &self.inner.database_folder
    }

    pub fn fs(&self) -> &SandboxFs {
        &self.inner.fs
    }

    pub fn permissions(&self) -> &NetPermissions {
        &self.inner.net
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.engine.stats()
    }

    pub(crate) fn engine(&self) -> &SessionEngine {
        &self.inner.engine
    }

    /// Check the network grant and confine any file destination, whether
    /// named explicitly or generated from `folder_prefix`.
    fn guard(&self, request: &OutboundRequest, options: &FetchOptions) -> Result<(), AppError> {
        self.inner.net.check(&request.url)?;
        if let Some(dest) = self.inner.engine.destination_for(request, options) {
            // The engine's download folder is the session folder.
            let relative = dest
                .strip_prefix(self.inner.engine.download_folder())
                .unwrap_or(&dest);
            self.inner.fs.resolve(relative)?;
        }
        Ok(())
    }

    pub async fn fetch(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, AppError> {
        let request = request.into();
        self.guard(&request, options)?;
        self.inner.engine.fetch(request, options).await
    }

    pub async fn fetch_text(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<String, AppError> {
        let request = request.into();
        self.guard(&request, options)?;
        self.inner.engine.fetch_text(request, options).await
    }

    pub async fn fetch_bytes(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<Bytes, AppError> {
        let request = request.into();
        self.guard(&request, options)?;
        self.inner.engine.fetch_bytes(request, options).await
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<T, AppError> {
        let request = request.into();
        self.guard(&request, options)?;
        self.inner.engine.fetch_json(request, options).await
    }

    pub async fn fetch_headers(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<HeaderMap, AppError> {
        let request = request.into();
        self.guard(&request, options)?;
        self.inner.engine.fetch_headers(request, options).await
    }

    pub async fn fetch_cookies(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<Vec<Cookie>, AppError> {
        let request = request.into();
        self.guard(&request, options)?;
        self.inner.engine.fetch_cookies(request, options).await
    }

    pub async fn fetch_file(
        &self,
        request: impl Into<OutboundRequest>,
        options: &FetchOptions,
    ) -> Result<PathBuf, AppError> {
        let request = request.into();
        self.guard(&request, &options.writing())?;
        self.inner.engine.fetch_file(request, options).await
    }
}
