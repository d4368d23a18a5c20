//! Collaborators invoked by the control loop.

use async_trait::async_trait;
use tracing::{error, info};

use crate::types::TickReport;

/// Exit code used when the process asks its supervisor for a clean restart.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Called after every completed control-loop pass.
#[async_trait]
pub trait TickHook: Send + Sync {
    async fn after_tick(&self, report: &TickReport);
}

pub struct NoopTickHook;

#[async_trait]
impl TickHook for NoopTickHook {
    async fn after_tick(&self, _report: &TickReport) {}
}

/// Logs a one-line summary of every pass that did work.
pub struct LoggingTickHook;

#[async_trait]
impl TickHook for LoggingTickHook {
    async fn after_tick(&self, report: &TickReport) {
        if report.rebuilt.is_empty() && report.reconciled.is_empty() {
            return;
        }
        info!(
            "Tick: {} rebuilt, {} reconciled, {} skipped, {} still queued",
            report.rebuilt.len(),
            report.reconciled.len(),
            report.skipped.len(),
            report.remaining
        );
    }
}

/// Restarts the whole process.
pub trait Supervisor: Send + Sync {
    fn restart(&self) -> !;
}

/// Exits with [`RESTART_EXIT_CODE`], relying on an external supervisor to
/// start the process again.
pub struct ExitSupervisor;

impl Supervisor for ExitSupervisor {
    fn restart(&self) -> ! {
        error!("Exiting for restart (code {})", RESTART_EXIT_CODE);
        std::process::exit(RESTART_EXIT_CODE)
    }
}
