//! Routing of analysis jobs to interchangeable execution backends.
//!
//! A job is either run directly against an [`ExecutionContext`] on the
//! calling task or sent as a [`DispatchRequest`] over a [`MessageBus`] to an
//! endpoint hosting its own context. Replies are matched to callers by
//! request id. The [`ExecutionContextRouter`] picks the most capable backend
//! the platform supports and falls back down the ranking when one fails to
//! initialise.

mod backend;
mod context;
mod envelope;
mod job;
mod router;
mod transport;

use serde::{Deserialize, Serialize};

pub use backend::{Backend, BackendState};
pub use context::{ContextHandler, ExecutionContext};
pub use envelope::{DispatchRequest, DispatchResponse, JobType, ResponseStatus};
pub use job::{AudioInput, Job, JobOutput, MotionJob};
pub use router::ExecutionContextRouter;
pub use transport::{
    spawn_dedicated_worker, spawn_endpoint, Connection, EndpointHandle, MessageBus,
    ProcessingMode, RequestHandler,
};

/// Execution backends in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Hidden document with direct access to the platform audio decoder.
    OffscreenDocument,
    /// Persistent worker shared by every connection.
    SharedWorker,
    /// Worker owned by a single caller.
    DedicatedWorker,
    /// The calling task itself.
    MainThread,
}

impl BackendKind {
    pub const PREFERENCE: [BackendKind; 4] = [
        BackendKind::OffscreenDocument,
        BackendKind::SharedWorker,
        BackendKind::DedicatedWorker,
        BackendKind::MainThread,
    ];
}

/// What the host platform can provide. The main thread is always available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformCapabilities {
    pub offscreen_document: bool,
    pub shared_worker: bool,
    pub dedicated_worker: bool,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            offscreen_document: false,
            shared_worker: false,
            dedicated_worker: true,
        }
    }
}

impl PlatformCapabilities {
    pub fn all() -> Self {
        Self {
            offscreen_document: true,
            shared_worker: true,
            dedicated_worker: true,
        }
    }

    pub fn main_thread_only() -> Self {
        Self {
            offscreen_document: false,
            shared_worker: false,
            dedicated_worker: false,
        }
    }

    pub fn supports(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::OffscreenDocument => self.offscreen_document,
            BackendKind::SharedWorker => self.shared_worker,
            BackendKind::DedicatedWorker => self.dedicated_worker,
            BackendKind::MainThread => true,
        }
    }
}
