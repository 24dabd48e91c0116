use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use uuid::Uuid;

use crate::engine::{EngineConfig, FetchEngine};
use crate::error::AppError;
use crate::models::{HeaderMap, OutboundRequest, ResponseBody};
use crate::options::{FetchOptions, StatusPolicy};
use crate::queue::ThrottleConfig;
use crate::routing::{ScraperDefinition, ScraperModule};
use crate::sandbox::permissions::NetPermissions;
use crate::sandbox::protocol::{ControllerMessage, WorkerMessage};
use crate::sandbox::worker::{WorkerHandle, WorkerResources, spawn_worker};
use crate::traits::{DynHttpClient, DynRequestCache, HttpClient, RequestCache};

/// Lifecycle of one sandbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Launched,
    Running,
    ProxyingFetch,
    Complete,
    Errored,
}

/// Events emitted by sessions for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SessionEvent<'a> {
    Created {
        session_id: Uuid,
        scraper: &'a str,
        folder: &'a Path,
    },
    Launched {
        session_id: Uuid,
        input: &'a str,
        fetch_piping: bool,
    },
    FetchProxied {
        session_id: Uuid,
        method: &'a str,
        url: &'a str,
    },
    Completed {
        session_id: Uuid,
    },
    Failed {
        session_id: Uuid,
        error: &'a AppError,
    },
    Terminated {
        session_id: Uuid,
        reason: &'a str,
    },
}

/// Trait for receiving session events (decoupled logging).
pub trait SessionReporter: Send + Sync {
    fn report(&self, event: SessionEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSessionReporter;

impl SessionReporter for TracingSessionReporter {
    fn report(&self, event: SessionEvent<'_>) {
        match event {
            SessionEvent::Created {
                session_id,
                scraper,
                folder,
            } => {
                tracing::info!(
                    %session_id,
                    %scraper,
                    folder = %folder.display(),
                    "Session created"
                );
            }
            SessionEvent::Launched {
                session_id,
                input,
                fetch_piping,
            } => {
                tracing::info!(%session_id, %input, %fetch_piping, "Session launched");
            }
            SessionEvent::FetchProxied {
                session_id,
                method,
                url,
            } => {
                tracing::debug!(%session_id, %method, %url, "Proxying fetch");
            }
            SessionEvent::Completed { session_id } => {
                tracing::info!(%session_id, "Session completed");
            }
            SessionEvent::Failed { session_id, error } => {
                tracing::warn!(
                    %session_id,
                    %error,
                    permission_denied = error.is_permission_denied(),
                    "Session failed"
                );
            }
            SessionEvent::Terminated { session_id, reason } => {
                tracing::warn!(%session_id, %reason, "Session terminated");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Sessions live in `<download_folder>/<scraper folder>/<input>`.
    pub download_folder: PathBuf,
    /// Throttle for fetches the controller performs on behalf of sessions.
    pub throttle: ThrottleConfig,
    pub default_headers: HeaderMap,
}

impl ControllerConfig {
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

/// Per-session choices.
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Route every network call through the controller.
    pub fetch_piping: bool,
    /// A cache owned by this session and closed with it. When absent the
    /// session shares the controller's cache.
    pub cache: Option<DynRequestCache>,
}

impl SessionOptions {
    pub fn piped() -> Self {
        Self {
            fetch_piping: true,
            cache: None,
        }
    }

    pub fn with_cache<S: RequestCache>(mut self, cache: S) -> Self {
        self.cache = Some(DynRequestCache::new(cache));
        self
    }
}

/// Creates sandbox sessions and serves their proxied fetches.
pub struct SandboxController<H, S> {
    config: ControllerConfig,
    client: DynHttpClient,
    cache: DynRequestCache,
    engine: FetchEngine<H, S>,
    reporter: Arc<dyn SessionReporter>,
}

impl<H: HttpClient, S: RequestCache> SandboxController<H, S> {
    /// `cache` is shared by every session that does not bring its own.
    pub fn new(client: H, cache: S, config: ControllerConfig) -> Result<Self, AppError> {
        let engine_config = EngineConfig {
            download_folder: config.download_folder.clone(),
            throttle: config.throttle,
            default_headers: config.default_headers.clone(),
        };
        Ok(Self {
            client: DynHttpClient::new(client.clone()),
            cache: DynRequestCache::new(cache.clone()),
            engine: FetchEngine::new(client, cache, engine_config)?,
            config,
            reporter: Arc::new(TracingSessionReporter),
        })
    }

    pub fn with_reporter(mut self, reporter: impl SessionReporter + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The engine used for proxied fetches.
    pub fn engine(&self) -> &FetchEngine<H, S> {
        &self.engine
    }

    /// Route `input` to an entrypoint of `module` and start a worker for it.
    pub async fn create_session(
        &self,
        module: Arc<ScraperModule>,
        input: &str,
        options: SessionOptions,
    ) -> Result<Session<H, S>, AppError> {
        let matched = module.match_input(input)?;
        let definition = module.definition.clone();
        let permissions = NetPermissions::from_patterns(definition.permissions.as_deref())?;

        let database_folder = self.config.download_folder.join(definition.folder_name());
        let folder = database_folder.join(session_folder_name(input));
        tokio::fs::create_dir_all(&folder).await?;

        let resources = match options.cache {
            Some(cache) => WorkerResources {
                client: self.client.clone(),
                cache,
                owns_cache: true,
            },
            None => WorkerResources {
                client: self.client.clone(),
                cache: self.cache.clone(),
                owns_cache: false,
            },
        };
        let worker = spawn_worker(module, resources);

        let session = Session {
            id: Uuid::new_v4(),
            definition,
            input: input.to_string(),
            folder,
            database_folder,
            entrypoint_ref: matched.index,
            fetch_piping: options.fetch_piping,
            permissions,
            state: SessionState::Created,
            terminated: false,
            worker,
            engine: self.engine.clone(),
            reporter: Arc::clone(&self.reporter),
        };
        self.reporter.report(SessionEvent::Created {
            session_id: session.id,
            scraper: &session.definition.name,
            folder: &session.folder,
        });
        Ok(session)
    }

    /// Create, launch and await one session, then shut it down.
    pub async fn run(
        &self,
        module: Arc<ScraperModule>,
        input: &str,
        options: SessionOptions,
    ) -> Result<(), AppError> {
        self.create_session(module, input, options).await?.run().await
    }

    /// Close the controller's queue and the shared cache.
    pub async fn close(&self) -> Result<(), AppError> {
        self.engine.close().await
    }
}

/// One scraper invocation running in its own worker.
pub struct Session<H, S> {
    id: Uuid,
    definition: ScraperDefinition,
    input: String,
    folder: PathBuf,
    database_folder: PathBuf,
    entrypoint_ref: usize,
    fetch_piping: bool,
    permissions: NetPermissions,
    state: SessionState,
    terminated: bool,
    worker: WorkerHandle,
    engine: FetchEngine<H, S>,
    reporter: Arc<dyn SessionReporter>,
}

impl<H: HttpClient, S: RequestCache> Session<H, S> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn database_folder(&self) -> &Path {
        &self.database_folder
    }

    /// Send the `launch` message.
    pub fn launch(&mut self) -> Result<(), AppError> {
        if self.state != SessionState::Created {
            return Err(AppError::ProtocolViolation(format!(
                "cannot launch a session in state {:?}",
                self.state
            )));
        }
        let message = ControllerMessage::Launch {
            fetch_piping: self.fetch_piping,
            definition: self.definition.clone(),
            folder: self.folder.clone(),
            database_folder: self.database_folder.clone(),
            name: self.definition.name.clone(),
            entrypoint_ref: self.entrypoint_ref,
            input: self.input.clone(),
        };
        self.send(message)?;
        self.state = SessionState::Launched;
        self.reporter.report(SessionEvent::Launched {
            session_id: self.id,
            input: &self.input,
            fetch_piping: self.fetch_piping,
        });
        Ok(())
    }

    /// Serve the worker until it reports `complete` or `error`.
    pub async fn wait(&mut self) -> Result<(), AppError> {
        if self.state == SessionState::Created {
            return Err(AppError::ProtocolViolation(
                "session must be launched before it is awaited".into(),
            ));
        }
        if matches!(self.state, SessionState::Complete | SessionState::Errored) {
            return Err(AppError::ProtocolViolation("session has already finished".into()));
        }

        let mut proxied: JoinSet<ControllerMessage> = JoinSet::new();
        let outcome = loop {
            tokio::select! {
                Some(done) = proxied.join_next(), if !proxied.is_empty() => {
                    let reply = match done {
                        Ok(reply) => reply,
                        Err(e) => {
                            break Err(AppError::Generic(format!("proxied fetch task failed: {e}")));
                        }
                    };
                    if let Err(e) = self.send(reply) {
                        break Err(e);
                    }
                    if proxied.is_empty() {
                        self.state = SessionState::Running;
                    }
                }
                message = self.worker.from_worker.recv() => {
                    let Some(message) = message else {
                        break Err(AppError::ProtocolViolation(
                            "worker exited without reporting completion".into(),
                        ));
                    };
                    if self.state == SessionState::Launched {
                        self.state = SessionState::Running;
                    }
                    match message {
                        WorkerMessage::Complete => break Ok(()),
                        WorkerMessage::Error { kind, message, stacktrace } => {
                            break Err(kind.into_error(message, stacktrace));
                        }
                        WorkerMessage::Fetch { fetch_id, method, url, body, headers } => {
                            if !self.fetch_piping {
                                self.terminate_worker("fetch without fetch piping");
                                break Err(AppError::ProtocolViolation(
                                    "fetch message on a session without fetch piping".into(),
                                ));
                            }
                            if let Err(e) = self.permissions.check(&url) {
                                self.terminate_worker("proxied fetch outside the allow-list");
                                break Err(e);
                            }
                            self.reporter.report(SessionEvent::FetchProxied {
                                session_id: self.id,
                                method: &method,
                                url: &url,
                            });
                            self.state = SessionState::ProxyingFetch;
                            let mut request = OutboundRequest::get(url).with_method(method);
                            request.headers = headers;
                            request.body = body;
                            proxied.spawn(proxy_fetch(self.engine.clone(), fetch_id, request));
                        }
                    }
                }
            }
        };

        match &outcome {
            Ok(()) => {
                self.state = SessionState::Complete;
                self.reporter.report(SessionEvent::Completed { session_id: self.id });
            }
            Err(error) => {
                self.state = SessionState::Errored;
                self.reporter.report(SessionEvent::Failed {
                    session_id: self.id,
                    error,
                });
            }
        }
        outcome
    }

    /// Ask the worker to release its resources and wait for it to exit.
    ///
    /// A worker whose entrypoint is still running finishes it first.
    pub async fn shutdown(mut self) {
        if !self.terminated {
            let _ = self.worker.to_worker.send(ControllerMessage::Shutdown);
        }
        if let Err(e) = (&mut self.worker.task).await {
            tracing::warn!(session_id = %self.id, error = %e, "Worker task failed");
        }
    }

    /// Stop the worker immediately, abandoning any proxied fetch.
    pub async fn terminate(mut self, reason: &str) {
        self.terminate_worker(reason);
        let _ = (&mut self.worker.task).await;
    }

    /// Launch, wait, then shut down. Returns the entrypoint's outcome.
    pub async fn run(mut self) -> Result<(), AppError> {
        if let Err(e) = self.launch() {
            self.terminate("launch failed").await;
            return Err(e);
        }
        let outcome = self.wait().await;
        self.shutdown().await;
        outcome
    }

    fn send(&self, message: ControllerMessage) -> Result<(), AppError> {
        let command = message.command();
        self.worker.to_worker.send(message).map_err(|_| {
            AppError::ProtocolViolation(format!("worker is gone; could not send {command}"))
        })
    }

    fn terminate_worker(&mut self, reason: &str) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.worker.cancel.cancel();
        self.reporter.report(SessionEvent::Terminated {
            session_id: self.id,
            reason,
        });
    }
}

/// Perform a proxied fetch and package the outcome for the worker.
///
/// Caching and status validation are the worker engine's job, so the
/// controller fetches uncached and accepts every status.
async fn proxy_fetch<H: HttpClient, S: RequestCache>(
    engine: FetchEngine<H, S>,
    fetch_id: String,
    request: OutboundRequest,
) -> ControllerMessage {
    let options = FetchOptions::new()
        .no_cache()
        .validate_status(StatusPolicy::Any);
    let fetched = match engine.fetch(request, &options).await {
        Ok(response) => match response.body {
            ResponseBody::Bytes(bytes) => Ok((response.status, response.headers, bytes.to_vec())),
            ResponseBody::File(path) => tokio::fs::read(&path)
                .await
                .map(|body| (response.status, response.headers, body))
                .map_err(AppError::from),
        },
        Err(e) => Err(e),
    };
    match fetched {
        Ok((status, headers, body)) => ControllerMessage::FetchResponse {
            fetch_id,
            status,
            headers,
            body,
            error: None,
        },
        Err(e) => ControllerMessage::FetchResponse {
            fetch_id,
            status: 0,
            headers: HeaderMap::new(),
            body: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

/// Folder name for one input: path separators flattened, dot names escaped.
fn session_folder_name(input: &str) -> String {
    let name = input.replace(['/', '\\'], "_");
    match name.as_str() {
        "" | "." | ".." => format!("_{name}"),
        _ => name,
    }
}
