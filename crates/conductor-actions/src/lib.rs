//! Action runtime: decides where a named action executes.
//!
//! Actions are published into a binding table under qualified names
//! (`group.function`). A binding either calls an in-process function,
//! forwards to an isolated worker process hosting the action's module, or
//! proxies to a remote HTTP endpoint. The table is swapped atomically on
//! every publish, so lookups never block and never see a partial load.

pub mod pool;
pub mod protocol;
pub mod remote;
pub mod runtime;
pub mod types;
pub mod worker;

pub use pool::{CommandLauncher, SelfExecLauncher, WorkerHandle, WorkerLauncher, WorkerStatus};
pub use remote::RemoteEndpoint;
pub use runtime::ActionRuntime;
pub use types::*;
pub use worker::{serve, serve_stdio, ActionProvider, ModuleCatalog};
