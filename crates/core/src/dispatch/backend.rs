use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::{watch, OnceCell};

use super::{
    context::ExecutionContext,
    envelope::JobType,
    job::{Job, JobOutput},
    transport::{Connection, EndpointHandle},
    BackendKind,
};
use crate::{LipSyncError, Result};

const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    Initializing,
    Ready,
    Busy,
    Terminated,
}

enum BackendHost {
    /// Runs jobs on the calling task.
    Inline(Arc<ExecutionContext>),
    /// Ships jobs to an endpoint over the message bus.
    Remote {
        connection: Connection,
        endpoint: Mutex<Option<EndpointHandle>>,
        init_timeout: Duration,
    },
}

/// One execution backend and its state machine.
///
/// Initialisation is memoised: concurrent callers share a single attempt and
/// every job waits for it to settle before running. A failed attempt leaves
/// the backend `Terminated` for good.
pub struct Backend {
    kind: BackendKind,
    host: BackendHost,
    state: watch::Sender<BackendState>,
    init: OnceCell<std::result::Result<(), String>>,
    serial: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
}

impl Backend {
    /// Backend running an [`ExecutionContext`] directly, one job at a time.
    pub fn inline(kind: BackendKind, context: Arc<ExecutionContext>) -> Self {
        Self::with_host(kind, BackendHost::Inline(context))
    }

    /// Backend reaching an endpoint through `connection`.
    pub fn remote(kind: BackendKind, connection: Connection) -> Self {
        Self::with_host(
            kind,
            BackendHost::Remote {
                connection,
                endpoint: Mutex::new(None),
                init_timeout: DEFAULT_INIT_TIMEOUT,
            },
        )
    }

    /// Ties the lifetime of `endpoint` to this backend.
    pub fn with_endpoint(mut self, handle: EndpointHandle) -> Self {
        if let BackendHost::Remote { endpoint, .. } = &mut self.host {
            if let Ok(slot) = endpoint.get_mut() {
                *slot = Some(handle);
            }
        }
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        if let BackendHost::Remote { init_timeout, .. } = &mut self.host {
            *init_timeout = timeout;
        }
        self
    }

    fn with_host(kind: BackendKind, host: BackendHost) -> Self {
        let (state, _) = watch::channel(BackendState::Uninitialized);
        Self {
            kind,
            host,
            state,
            init: OnceCell::new(),
            serial: tokio::sync::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn state(&self) -> BackendState {
        *self.state.borrow()
    }

    /// Watches lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.state.subscribe()
    }

    pub async fn initialize(&self) -> Result<()> {
        let outcome = self
            .init
            .get_or_init(|| async {
                self.transition(BackendState::Initializing);
                match self.start().await {
                    Ok(()) => {
                        self.transition(BackendState::Ready);
                        tracing::info!(backend = ?self.kind, "backend ready");
                        Ok(())
                    }
                    Err(err) => {
                        self.terminate();
                        tracing::warn!(backend = ?self.kind, %err, "backend failed to initialise");
                        Err(err.to_string())
                    }
                }
            })
            .await;

        outcome.clone().map_err(|reason| {
            LipSyncError::BackendUnavailable(format!("{:?}: {reason}", self.kind))
        })
    }

    async fn start(&self) -> Result<()> {
        match &self.host {
            BackendHost::Inline(context) => context.initialize().await,
            BackendHost::Remote {
                connection,
                init_timeout,
                ..
            } => {
                let reply = tokio::time::timeout(
                    *init_timeout,
                    connection.call(JobType::Initialize, Value::Null, Vec::new()),
                )
                .await
                .map_err(|_| LipSyncError::Timeout(*init_timeout))??;
                reply.into_result().map(|_| ())
            }
        }
    }

    /// Runs `job`, waiting for initialisation first.
    pub async fn execute(&self, job: Job) -> Result<JobOutput> {
        self.initialize().await?;

        let _serial = match &self.host {
            BackendHost::Inline(_) => Some(self.serial.lock().await),
            BackendHost::Remote { .. } => None,
        };
        if self.state() == BackendState::Terminated {
            return Err(LipSyncError::BackendUnavailable(format!(
                "{:?} backend has been terminated",
                self.kind
            )));
        }

        let _busy = BusyGuard::enter(self);
        tracing::debug!(backend = ?self.kind, job = ?job.job_type(), "executing job");
        match &self.host {
            BackendHost::Inline(context) => context.run(job).await,
            BackendHost::Remote { connection, .. } => {
                let (job_type, data, attachments) = job.into_parts()?;
                let response = connection.call(job_type, data, attachments).await?;
                JobOutput::from_response(job_type, response)
            }
        }
    }

    /// Moves the backend to `Terminated` and stops any endpoint it owns.
    pub fn terminate(&self) {
        self.transition(BackendState::Terminated);
        if let BackendHost::Remote { endpoint, .. } = &self.host {
            if let Some(handle) = endpoint.lock().ok().and_then(|mut slot| slot.take()) {
                handle.shutdown();
            }
        }
    }

    fn transition(&self, next: BackendState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(backend = ?self.kind, from = ?previous, to = ?next, "backend state");
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

/// Holds the backend `Busy` while at least one job runs.
struct BusyGuard<'a> {
    backend: &'a Backend,
}

impl<'a> BusyGuard<'a> {
    fn enter(backend: &'a Backend) -> Self {
        if backend.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            backend.state.send_if_modified(|state| swap(state, BackendState::Ready, BackendState::Busy));
        }
        Self { backend }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.backend.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.backend
                .state
                .send_if_modified(|state| swap(state, BackendState::Busy, BackendState::Ready));
        }
    }
}

fn swap(state: &mut BackendState, from: BackendState, to: BackendState) -> bool {
    if *state == from {
        *state = to;
        true
    } else {
        false
    }
}
