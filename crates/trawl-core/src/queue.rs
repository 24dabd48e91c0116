//! Concurrency- and rate-limited task scheduling.
//!
//! [`RateLimitQueue`] runs submitted futures in FIFO order while enforcing a
//! ceiling on simultaneously running tasks and on the number of tasks started
//! within each one-second window. It knows nothing about HTTP; the fetch
//! engine submits its network calls through it.
//!
//! # Example
//!
//! ```rust,no_run
//! use trawl_core::queue::{RateLimitQueue, ThrottleConfig};
//!
//! # async fn run() -> Result<(), trawl_core::AppError> {
//! let queue = RateLimitQueue::new(
//!     ThrottleConfig::unlimited()
//!         .with_concurrent_limit(2)
//!         .with_rate_per_second(5),
//! )?;
//! let answer = queue.enqueue(async { Ok(42) }).await?;
//! assert_eq!(answer, 42);
//! queue.close()?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::AppError;

/// Throttling policy for outbound work.
///
/// `None` means unlimited; the default is a pure pass-through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Maximum number of tasks started per one-second window.
    #[serde(default)]
    pub rate_per_second: Option<u32>,

    /// Maximum number of tasks running at once.
    #[serde(default)]
    pub concurrent_limit: Option<usize>,
}

impl ThrottleConfig {
    /// No concurrency ceiling, no rate ceiling.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_rate_per_second(mut self, rate: u32) -> Self {
        self.rate_per_second = Some(rate);
        self
    }

    pub fn with_concurrent_limit(mut self, limit: usize) -> Self {
        self.concurrent_limit = Some(limit);
        self
    }

    pub fn is_passthrough(&self) -> bool {
        self.rate_per_second.is_none() && self.concurrent_limit.is_none()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.rate_per_second == Some(0) {
            return Err(AppError::ConfigError(
                "throttle.rate_per_second must be at least 1".into(),
            ));
        }
        if self.concurrent_limit == Some(0) {
            return Err(AppError::ConfigError(
                "throttle.concurrent_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueuedTask {
    ordinal: u64,
    job: Job,
}

struct QueueState {
    active: usize,
    window_second: u64,
    window_count: u32,
    /// Highest second a wake-up timer has been armed for.
    armed_second: u64,
    enqueued: u64,
    closed: bool,
    backlog: VecDeque<QueuedTask>,
}

struct QueueInner {
    config: ThrottleConfig,
    started_at: Instant,
    state: Mutex<QueueState>,
}

/// FIFO task queue with a concurrency ceiling and a per-second start rate.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct RateLimitQueue {
    inner: Arc<QueueInner>,
}

impl RateLimitQueue {
    pub fn new(config: ThrottleConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                started_at: Instant::now(),
                state: Mutex::new(QueueState {
                    active: 0,
                    window_second: 0,
                    window_count: 0,
                    armed_second: 0,
                    enqueued: 0,
                    closed: false,
                    backlog: VecDeque::new(),
                }),
            }),
        })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.inner.config
    }

    /// Submit `task` and return a future resolving to its result.
    ///
    /// The task is queued (and possibly started) before this returns, so the
    /// caller may register the returned future elsewhere before awaiting it.
    /// Must be called from within a tokio runtime.
    pub fn enqueue<T, F>(
        &self,
        task: F,
    ) -> impl Future<Output = Result<T, AppError>> + Send + 'static
    where
        T: Send + 'static,
        F: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(task.await);
        });

        let submitted = {
            let mut state = self.inner.lock();
            if state.closed {
                Err(AppError::Generic("rate limit queue is closed".into()))
            } else {
                let ordinal = state.enqueued;
                state.enqueued += 1;
                state.backlog.push_back(QueuedTask { ordinal, job });
                Ok(ordinal)
            }
        };
        if submitted.is_ok() {
            QueueInner::schedule(&self.inner);
        }

        async move {
            let ordinal = submitted?;
            rx.await.map_err(|_| {
                AppError::Generic(format!("queued task #{ordinal} was dropped before settling"))
            })?
        }
    }

    /// Tasks that are queued or still running.
    pub fn pending(&self) -> usize {
        let state = self.inner.lock();
        state.backlog.len() + state.active
    }

    /// Close the queue. Fails if any task is still queued or running.
    pub fn close(&self) -> Result<(), AppError> {
        let mut state = self.inner.lock();
        let pending = state.backlog.len() + state.active;
        if pending > 0 {
            return Err(AppError::QueueShutdown { pending });
        }
        state.closed = true;
        Ok(())
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The guarded section never panics, so a poisoned lock still holds
        // consistent counters.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_second(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Start as many backlog tasks as the limits allow.
    ///
    /// Runs on enqueue, on every settlement, and on the one-second wake-up.
    fn schedule(inner: &Arc<QueueInner>) {
        loop {
            let mut state = inner.lock();
            if state.backlog.is_empty() {
                return;
            }

            let second = inner.current_second();
            let concurrency_ok = inner
                .config
                .concurrent_limit
                .is_none_or(|limit| state.active < limit);
            let rate_ok = state.window_second != second
                || inner
                    .config
                    .rate_per_second
                    .is_none_or(|rate| state.window_count < rate);

            if !(concurrency_ok && rate_ok) {
                if !rate_ok {
                    Self::arm_wakeup(inner, &mut state, second);
                }
                return;
            }

            let Some(task) = state.backlog.pop_front() else {
                return;
            };
            state.active += 1;
            if state.window_second == second {
                state.window_count += 1;
            } else {
                state.window_second = second;
                state.window_count = 1;
            }
            let active = state.active;
            drop(state);

            tracing::debug!(task = task.ordinal, active, second, "Starting queued task");
            let guard = ActiveGuard {
                inner: Arc::clone(inner),
                ordinal: task.ordinal,
            };
            tokio::spawn(async move {
                task.job.await;
                drop(guard);
            });
        }
    }

    /// Arm a single timer for the start of the next window.
    fn arm_wakeup(inner: &Arc<QueueInner>, state: &mut QueueState, second: u64) {
        let next = second + 1;
        if state.armed_second >= next {
            return;
        }
        state.armed_second = next;
        let deadline = inner.started_at + Duration::from_secs(next);
        let inner = Arc::clone(inner);
        tracing::debug!(next_second = next, "Rate limit reached, waking next window");
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            QueueInner::schedule(&inner);
        });
    }
}

/// Releases a concurrency slot when a task settles, even by panicking.
struct ActiveGuard {
    inner: Arc<QueueInner>,
    ordinal: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.active = state.active.saturating_sub(1);
        }
        tracing::debug!(task = self.ordinal, "Queued task settled");
        QueueInner::schedule(&self.inner);
    }
}
