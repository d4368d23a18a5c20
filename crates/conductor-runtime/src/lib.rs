//! Service registry and reconciliation control loop.
//!
//! The [`Orchestrator`] builds services lazily from priority-ordered
//! registrations, resolves their manifests and keeps the cluster in line
//! with them on a self-throttling tick.

pub mod hooks;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod store;
pub mod types;

pub use hooks::{
    ExitSupervisor, LoggingTickHook, NoopTickHook, Supervisor, TickHook, RESTART_EXIT_CODE,
};
pub use orchestrator::Orchestrator;
pub use queue::RegenerationQueue;
pub use registry::{ContextBuilder, ContextRegistry, Ranked, Registry, ServiceRegistry};
pub use store::{MemoryStateStore, SqliteStateStore, StateStore};
pub use types::*;
