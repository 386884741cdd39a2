//! Scheduling of math typesetting passes over a rendered container.
//!
//! A typesetting engine works on markup that is already committed to a view,
//! asynchronously, and may still be loading when the first answer arrives.
//! [`TypesetScheduler`] owns one container and runs passes over it one at a
//! time: wait for the engine, clear the previous render, typeset, repeat when
//! the content changes again.
//!
//! ```text
//! Idle --content change--> Pending --engine ready--> Rendering --done--> Idle
//!                           |    ^
//!                           +----+ not ready: wait for the ready event, or
//!                                  poll every retry_delay
//! ```
//!
//! Teardown flips the liveness token. Every transition checks it first, so
//! a retry or a completion that lands after teardown does nothing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TypesetError;


pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A math typesetting engine, passed explicitly into the scheduler.
pub trait Typesetter: Send + Sync + 'static {
    /// Handle to the region of the view the engine works on.
    type Scope: Send + Sync + 'static;

    fn is_ready(&self) -> bool;

    /// Flips to `true` once the engine has loaded, for engines that announce
    /// it. Engines without one return `None` and get polled via
    /// [`is_ready`](Typesetter::is_ready).
    fn ready_event(&self) -> Option<watch::Receiver<bool>> {
        None
    }

    /// Removes any previously rendered math inside `scope`.
    fn clear(&self, scope: &Self::Scope);

    fn typeset(&self, scope: &Self::Scope)
    -> impl Future<Output = Result<(), TypesetError>> + Send;
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long to wait between readiness checks when the engine has no
    /// ready event
    pub retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional env vars:
    /// - `TUTOR_TYPESET_RETRY_MS`: Delay between engine readiness checks (default: 500)
    pub fn from_env() -> Self {
        Self::from_retry_var(std::env::var("TUTOR_TYPESET_RETRY_MS").ok().as_deref())
    }

    fn from_retry_var(value: Option<&str>) -> Self {
        let retry_delay = value
            .and_then(|s| s.trim().parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_DELAY);
        Self { retry_delay }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TypesetState {
    #[default]
    Idle,
    /// Content changed, waiting for the engine.
    Pending,
    /// Cleared and handed to the engine.
    Rendering,
}

/// Scheduler state plus the content generation it applies to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TypesetStatus {
    pub state: TypesetState,
    pub generation: u64,
}

pub struct TypesetScheduler<T: Typesetter> {
    engine: Arc<T>,
    scope: T::Scope,
    config: SchedulerConfig,
}

impl<T: Typesetter> TypesetScheduler<T> {
    pub fn new(engine: Arc<T>, scope: T::Scope, config: SchedulerConfig) -> Self {
        Self {
            engine,
            scope,
            config,
        }
    }

    /// Starts the scheduler on the current tokio runtime.
    pub fn spawn(self) -> TypesetHandle {
        let (content_tx, content_rx) = watch::channel(0);
        let (status_tx, status_rx) = watch::channel(TypesetStatus::default());
        let live = CancellationToken::new();
        let task = tokio::spawn(self.run(content_rx, status_tx, live.clone()));

        TypesetHandle {
            content: content_tx,
            status: status_rx,
            live,
            task: Some(task),
        }
    }

    async fn run(
        self,
        mut content: watch::Receiver<u64>,
        status: watch::Sender<TypesetStatus>,
        live: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = live.cancelled() => break,
                changed = content.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if live.is_cancelled() {
                break;
            }
            let generation = *content.borrow_and_update();
            status.send_replace(TypesetStatus {
                state: TypesetState::Pending,
                generation,
            });

            if !self.wait_until_ready(&live).await {
                break;
            }

            // Changes that arrived while pending are covered by this pass.
            let generation = *content.borrow_and_update();
            status.send_replace(TypesetStatus {
                state: TypesetState::Rendering,
                generation,
            });
            self.engine.clear(&self.scope);
            let outcome = self.engine.typeset(&self.scope).await;

            // In-flight passes can't be aborted, only ignored.
            if live.is_cancelled() {
                break;
            }
            if let Err(error) = outcome {
                warn!(generation, error = %error, "typeset pass failed, leaving source visible");
            }
            status.send_replace(TypesetStatus {
                state: TypesetState::Idle,
                generation,
            });
        }
    }

    /// Returns `false` if torn down before the engine became ready.
    async fn wait_until_ready(&self, live: &CancellationToken) -> bool {
        let mut ready_event = self.engine.ready_event();
        loop {
            if live.is_cancelled() {
                return false;
            }
            if self.engine.is_ready() {
                return true;
            }
            match ready_event.as_mut() {
                Some(event) => {
                    let closed = tokio::select! {
                        biased;
                        _ = live.cancelled() => return false,
                        announced = event.wait_for(|ready| *ready) => announced.is_err(),
                    };
                    if closed {
                        debug!("typesetter ready event closed, polling instead");
                        ready_event = None;
                    }
                }
                None => {
                    debug!(retry_in = ?self.config.retry_delay, "typesetter not ready");
                    tokio::select! {
                        biased;
                        _ = live.cancelled() => return false,
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }
    }
}

/// Owner-side handle to a running scheduler. Dropping it tears the scheduler
/// down.
pub struct TypesetHandle {
    content: watch::Sender<u64>,
    status: watch::Receiver<TypesetStatus>,
    live: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TypesetHandle {
    /// Signals that new markup was committed to the container. Returns the
    /// new content generation.
    pub fn content_changed(&self) -> u64 {
        self.content.send_modify(|generation| *generation += 1);
        *self.content.borrow()
    }

    pub fn status(&self) -> TypesetStatus {
        *self.status.borrow()
    }

    pub fn is_live(&self) -> bool {
        !self.live.is_cancelled()
    }

    /// Resolves once the latest content change has been through a pass, or
    /// the scheduler has stopped.
    pub async fn settled(&self) {
        let target = *self.content.borrow();
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|s| s.state == TypesetState::Idle && s.generation >= target)
            .await;
    }

    /// Marks the owning view as gone. Pending retries and in-flight
    /// completions become no-ops.
    pub fn teardown(&self) {
        self.live.cancel();
    }

    /// Tears down and waits for the scheduler task to finish, including any
    /// pass the engine is still running.
    pub async fn shutdown(mut self) {
        self.live.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(error = %error, "typeset scheduler task ended abnormally");
            }
        }
    }
}

impl Drop for TypesetHandle {
    fn drop(&mut self) {
        self.live.cancel();
    }
}
