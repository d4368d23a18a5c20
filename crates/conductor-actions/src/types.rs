//! Action runtime types.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::pool::WorkerHandle;
use crate::remote::RemoteEndpoint;

/// Positional arguments of an action call.
pub type Args = Vec<Value>;

/// Named arguments of an action call.
pub type Kwargs = serde_json::Map<String, Value>;

/// An in-process action. Application failures are returned as `Err(message)`.
pub type LocalFn = Arc<dyn Fn(&[Value], &Kwargs) -> Result<Value, String> + Send + Sync>;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Action not found: {0}")]
    NotFound(String),

    /// The worker did not answer in time, exited, or is shutting down.
    #[error("Worker for module {module} unavailable: {reason}")]
    WorkerUnavailable { module: String, reason: String },

    /// The action ran and reported a failure.
    #[error("Action {action} failed: {message}")]
    Application { action: String, message: String },

    #[error("Remote action {action} failed: {message}")]
    Remote {
        action: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Failed to launch worker for {module}: {reason}")]
    Launch { module: String, reason: String },
}

impl ActionError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::WorkerUnavailable { .. })
    }
}

/// Where a bound action executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Local,
    WorkerProxy,
    RemoteProxy,
}

/// Invocation target of a binding.
#[derive(Clone)]
pub enum ActionTarget {
    Local(LocalFn),
    Worker(Arc<WorkerHandle>),
    Remote {
        endpoint: Arc<RemoteEndpoint>,
        params: Vec<String>,
    },
}

/// A published action.
#[derive(Clone)]
pub struct ActionBinding {
    pub name: String,
    pub target: ActionTarget,
}

impl ActionBinding {
    pub fn kind(&self) -> ActionKind {
        match self.target {
            ActionTarget::Local(_) => ActionKind::Local,
            ActionTarget::Worker(_) => ActionKind::WorkerProxy,
            ActionTarget::Remote { .. } => ActionKind::RemoteProxy,
        }
    }

    /// Module owning a worker-proxied binding.
    pub fn module(&self) -> Option<&str> {
        match &self.target {
            ActionTarget::Worker(handle) => Some(handle.module()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ActionBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionBinding")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Summary row for listing bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionInfo {
    pub name: String,
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}
