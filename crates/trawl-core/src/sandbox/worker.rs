//! The sandbox side of a session.
//!
//! A worker is a spawned task that owns one scraper invocation. It talks to
//! its controller only through the two message channels: it never sees the
//! controller's engine, and when fetch piping is on its own engine reaches
//! the network exclusively by sending `fetch` messages.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{EngineConfig, FetchEngine};
use crate::error::AppError;
use crate::models::{HeaderMap, OutboundRequest};
use crate::routing::{ScraperDefinition, ScraperModule};
use crate::sandbox::context::ScrapeContext;
use crate::sandbox::permissions::NetPermissions;
use crate::sandbox::protocol::{ControllerMessage, WorkerMessage};
use crate::traits::{DynHttpClient, DynRequestCache, HttpClient, HttpResponse, RequestCache};

/// The transport a session engine uses: the real client, or the controller
/// reached over the message channel.
#[derive(Clone)]
pub(crate) enum SessionClient {
    Direct(DynHttpClient),
    Proxy(ProxyClient),
}

impl HttpClient for SessionClient {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, AppError> {
        match self {
            SessionClient::Direct(client) => client.send(request).await,
            SessionClient::Proxy(proxy) => proxy.send(request).await,
        }
    }
}

struct ProxiedReply {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    error: Option<String>,
}

type PendingFetches = Arc<Mutex<HashMap<String, oneshot::Sender<ProxiedReply>>>>;

fn lock_pending(
    pending: &PendingFetches,
) -> MutexGuard<'_, HashMap<String, oneshot::Sender<ProxiedReply>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Turns network calls into `fetch` messages correlated by `fetch_id`.
#[derive(Clone)]
pub(crate) struct ProxyClient {
    outbox: mpsc::UnboundedSender<WorkerMessage>,
    pending: PendingFetches,
}

impl ProxyClient {
    async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, AppError> {
        let fetch_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(fetch_id.clone(), tx);

        let message = WorkerMessage::Fetch {
            fetch_id: fetch_id.clone(),
            method: request.method,
            url: request.url,
            body: request.body,
            headers: request.headers,
        };
        if self.outbox.send(message).is_err() {
            lock_pending(&self.pending).remove(&fetch_id);
            return Err(AppError::NetworkError("controller channel is closed".into()));
        }

        let reply = rx.await.map_err(|_| {
            AppError::NetworkError(format!("proxied fetch {fetch_id} was abandoned"))
        })?;
        match reply.error {
            Some(error) => Err(AppError::NetworkError(error)),
            None => Ok(HttpResponse::from_bytes(reply.status, reply.headers, reply.body)),
        }
    }
}

/// What the controller lends a worker.
pub(crate) struct WorkerResources {
    pub client: DynHttpClient,
    pub cache: DynRequestCache,
    /// Close `cache` on shutdown. False for a handle shared across sessions.
    pub owns_cache: bool,
}

/// Controller-side ends of a worker's channels.
pub(crate) struct WorkerHandle {
    pub to_worker: mpsc::UnboundedSender<ControllerMessage>,
    pub from_worker: mpsc::UnboundedReceiver<WorkerMessage>,
    pub task: JoinHandle<()>,
    pub cancel: CancellationToken,
}

pub(crate) fn spawn_worker(module: Arc<ScraperModule>, resources: WorkerResources) -> WorkerHandle {
    let (to_worker, inbox) = mpsc::unbounded_channel();
    let (outbox, from_worker) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let worker = Worker {
        module,
        resources,
        pending: Arc::default(),
        outbox,
        context: None,
        shutting_down: false,
    };
    let task = tokio::spawn(worker.run(inbox, cancel.clone()));

    WorkerHandle {
        to_worker,
        from_worker,
        task,
        cancel,
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Worker {
    module: Arc<ScraperModule>,
    resources: WorkerResources,
    pending: PendingFetches,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
    context: Option<ScrapeContext>,
    shutting_down: bool,
}

impl Worker {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<ControllerMessage>,
        cancel: CancellationToken,
    ) {
        let mut entrypoint: JoinSet<Result<(), AppError>> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(scraper = %self.module.name(), "Worker terminated");
                    break;
                }
                Some(settled) = entrypoint.join_next(), if !entrypoint.is_empty() => {
                    self.report(settled);
                    if self.shutting_down {
                        break;
                    }
                }
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    if let Flow::Stop = self.handle(message, &mut entrypoint) {
                        break;
                    }
                }
            }
        }

        // Dropping the set aborts an entrypoint still running after a
        // terminate, along with any proxied fetch it was waiting on.
        drop(entrypoint);
        self.release().await;
    }

    fn handle(
        &mut self,
        message: ControllerMessage,
        entrypoint: &mut JoinSet<Result<(), AppError>>,
    ) -> Flow {
        match message {
            ControllerMessage::Launch { .. } if self.context.is_some() => {
                self.fail(AppError::ProtocolViolation("received a second launch".into()));
                Flow::Stop
            }
            ControllerMessage::Launch {
                fetch_piping,
                definition,
                folder,
                database_folder,
                name,
                entrypoint_ref,
                input,
            } => {
                let launch = Launch {
                    fetch_piping,
                    definition,
                    folder,
                    database_folder,
                    name,
                    entrypoint_ref,
                    input,
                };
                match self.launch(launch, entrypoint) {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        self.fail(e);
                        Flow::Stop
                    }
                }
            }
            ControllerMessage::FetchResponse {
                fetch_id,
                status,
                headers,
                body,
                error,
            } => {
                let Some(waiter) = lock_pending(&self.pending).remove(&fetch_id) else {
                    self.fail(AppError::ProtocolViolation(format!(
                        "fetch_response for unknown fetch_id {fetch_id}"
                    )));
                    return Flow::Stop;
                };
                // The entrypoint may have given up on this fetch already.
                let _ = waiter.send(ProxiedReply {
                    status,
                    headers,
                    body,
                    error,
                });
                Flow::Continue
            }
            ControllerMessage::Shutdown => {
                self.shutting_down = true;
                if entrypoint.is_empty() {
                    Flow::Stop
                } else {
                    tracing::debug!(
                        scraper = %self.module.name(),
                        "Shutdown deferred until entrypoint settles"
                    );
                    Flow::Continue
                }
            }
        }
    }

    fn launch(
        &mut self,
        launch: Launch,
        entrypoint: &mut JoinSet<Result<(), AppError>>,
    ) -> Result<(), AppError> {
        if launch.name != self.module.name() {
            return Err(AppError::ProtocolViolation(format!(
                "launch names scraper '{}' but this worker hosts '{}'",
                launch.name,
                self.module.name()
            )));
        }
        let matched = self.module.match_input(&launch.input)?;
        if matched.index != launch.entrypoint_ref {
            return Err(AppError::ProtocolViolation(format!(
                "launch names entrypoint {} but input '{}' routes to {}",
                launch.entrypoint_ref, launch.input, matched.index
            )));
        }

        let net = NetPermissions::from_patterns(launch.definition.permissions.as_deref())?;
        let client = if launch.fetch_piping {
            SessionClient::Proxy(ProxyClient {
                outbox: self.outbox.clone(),
                pending: Arc::clone(&self.pending),
            })
        } else {
            SessionClient::Direct(self.resources.client.clone())
        };
        let engine = FetchEngine::new(
            client,
            self.resources.cache.clone(),
            engine_config(&launch.definition, launch.folder.clone()),
        )?;

        let context = ScrapeContext::new(
            launch.name,
            launch.input.clone(),
            launch.folder,
            launch.database_folder,
            net,
            engine,
        );
        tracing::debug!(
            scraper = %self.module.name(),
            entrypoint = matched.index,
            fetch_piping = launch.fetch_piping,
            "Entrypoint launched"
        );
        entrypoint.spawn((matched.handler)(context.clone(), launch.input, matched.vars));
        self.context = Some(context);
        Ok(())
    }

    fn report(&self, settled: Result<Result<(), AppError>, JoinError>) {
        let message = match settled {
            Ok(Ok(())) => WorkerMessage::Complete,
            Ok(Err(e)) => WorkerMessage::from_error(&e),
            Err(join_error) => {
                WorkerMessage::from_error(&AppError::Generic(panic_message(join_error)))
            }
        };
        let _ = self.outbox.send(message);
    }

    fn fail(&self, error: AppError) {
        tracing::warn!(scraper = %self.module.name(), error = %error, "Worker failed");
        let _ = self.outbox.send(WorkerMessage::from_error(&error));
    }

    /// Close what this session owns. A shared cache stays open.
    async fn release(&self) {
        if let Some(context) = &self.context
            && let Err(e) = context.engine().queue().close()
        {
            tracing::warn!(
                scraper = %self.module.name(),
                error = %e,
                "Session queue closed with work pending"
            );
        }
        if self.resources.owns_cache
            && let Err(e) = self.resources.cache.close().await
        {
            tracing::warn!(
                scraper = %self.module.name(),
                error = %e,
                "Failed to close session cache"
            );
        }
    }
}

struct Launch {
    fetch_piping: bool,
    definition: ScraperDefinition,
    folder: PathBuf,
    database_folder: PathBuf,
    name: String,
    entrypoint_ref: usize,
    input: String,
}

fn engine_config(definition: &ScraperDefinition, folder: PathBuf) -> EngineConfig {
    let mut config =
        EngineConfig::new(folder).with_throttle(definition.throttle.unwrap_or_default());
    for (name, value) in definition.headers.iter().flatten() {
        config = config.with_default_header(name, value.clone());
    }
    config
}

fn panic_message(error: JoinError) -> String {
    if error.is_cancelled() {
        return "entrypoint was cancelled".to_string();
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("entrypoint panicked: {detail}")
}
