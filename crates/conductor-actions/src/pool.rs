//! Worker processes hosting hot-loaded action modules.
//!
//! Each module runs in its own OS process. The host talks to it over two
//! one-way channels: requests go through an unbounded queue drained by a
//! writer task into the child's stdin, replies come back on stdout and are
//! routed by a reader task to the waiting caller by request id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::protocol::{self, HostMessage, WorkerMessage};
use crate::types::{ActionError, Args, Kwargs};

/// Builds the command that starts a worker for a module.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, module: &str) -> Result<Command, ActionError>;
}

/// Re-executes the current binary as `<exe> worker <module>`.
pub struct SelfExecLauncher;

impl WorkerLauncher for SelfExecLauncher {
    fn command(&self, module: &str) -> Result<Command, ActionError> {
        let exe = std::env::current_exe().map_err(|e| ActionError::Launch {
            module: module.to_string(),
            reason: e.to_string(),
        })?;
        let mut command = Command::new(exe);
        command.arg("worker").arg(module);
        Ok(command)
    }
}

/// Runs `<program> <args..> <module>`.
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl WorkerLauncher for CommandLauncher {
    fn command(&self, module: &str) -> Result<Command, ActionError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(module);
        Ok(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Initializing,
    Ready,
    Terminating,
}

struct Reply {
    result: Value,
    error: Option<String>,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Host-side handle to one worker process.
pub struct WorkerHandle {
    module: String,
    status: Arc<Mutex<WorkerStatus>>,
    terminating: Arc<AtomicBool>,
    in_flight: AtomicUsize,
    idle: Notify,
    next_id: AtomicU64,
    requests: Mutex<Option<mpsc::UnboundedSender<HostMessage>>>,
    pending: PendingReplies,
    alive: Arc<AtomicBool>,
    child: tokio::sync::Mutex<Option<Child>>,
    actions: Mutex<Vec<String>>,
}

impl WorkerHandle {
    /// A handle in `Initializing` state with no process yet.
    pub fn new(module: &str) -> Arc<Self> {
        Arc::new(Self {
            module: module.to_string(),
            status: Arc::new(Mutex::new(WorkerStatus::Initializing)),
            terminating: Arc::new(AtomicBool::new(false)),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            next_id: AtomicU64::new(1),
            requests: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            alive: Arc::new(AtomicBool::new(false)),
            child: tokio::sync::Mutex::new(None),
            actions: Mutex::new(Vec::new()),
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: WorkerStatus) {
        *self.status.lock() = status;
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Action names the worker reported at setup.
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    /// Spawn the worker and wait for its setup report.
    ///
    /// There is deliberately no timeout here: a module whose setup hangs
    /// blocks the caller.
    pub async fn start(
        &self,
        launcher: &dyn WorkerLauncher,
        context: &Value,
    ) -> Result<Vec<String>, ActionError> {
        let launch_error = |reason: String| ActionError::Launch {
            module: self.module.clone(),
            reason,
        };

        let mut command = launcher.command(&self.module)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| launch_error(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error("worker stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let setup = protocol::encode(&HostMessage::Setup {
            module: self.module.clone(),
            context: context.clone(),
        })?;
        stdin
            .write_all(setup.as_bytes())
            .await
            .map_err(|e| launch_error(e.to_string()))?;
        stdin.flush().await.map_err(|e| launch_error(e.to_string()))?;

        let actions = loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| launch_error(e.to_string()))?
                .ok_or_else(|| launch_error("worker exited during setup".into()))?;
            match protocol::decode::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Ready { actions }) => break actions,
                Ok(WorkerMessage::SetupFailed { error }) => return Err(launch_error(error)),
                Ok(other) => warn!("Unexpected message from {} during setup: {:?}", self.module, other),
                Err(_) => debug!("Ignoring non-protocol output from {}: {}", self.module, line),
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<HostMessage>();
        let module = self.module.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let line = match protocol::encode(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Failed to encode request for {}: {}", module, e);
                        continue;
                    }
                };
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!("Worker {} stdin closed: {}", module, e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    warn!("Worker {} stdin flush failed: {}", module, e);
                    break;
                }
            }
            debug!("Request channel for {} closed", module);
        });

        let pending = self.pending.clone();
        let alive = self.alive.clone();
        let terminating = self.terminating.clone();
        let status = self.status.clone();
        let module = self.module.clone();
        alive.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match protocol::decode::<WorkerMessage>(&line) {
                        Ok(WorkerMessage::Reply { id, result, error }) => {
                            match pending.lock().remove(&id) {
                                Some(tx) => {
                                    let _ = tx.send(Reply { result, error });
                                }
                                None => debug!("Discarding late reply {} from {}", id, module),
                            }
                        }
                        Ok(other) => warn!("Unexpected message from {}: {:?}", module, other),
                        Err(_) => debug!("Ignoring non-protocol output from {}: {}", module, line),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Reading from worker {} failed: {}", module, e);
                        break;
                    }
                }
            }
            alive.store(false, Ordering::SeqCst);
            // a worker that went away on its own is replaced on the next load
            if !terminating.swap(true, Ordering::SeqCst) {
                warn!("Worker {} exited unexpectedly", module);
            }
            *status.lock() = WorkerStatus::Terminating;
            // dropping the senders fails every waiting call
            pending.lock().clear();
            debug!("Reply channel for {} closed", module);
        });

        *self.requests.lock() = Some(tx);
        *self.child.lock().await = Some(child);
        *self.actions.lock() = actions.clone();
        Ok(actions)
    }

    /// Send one call and wait up to `timeout` for its reply.
    pub async fn call(
        &self,
        name: &str,
        args: Args,
        kwargs: Kwargs,
        timeout: Duration,
    ) -> Result<Value, ActionError> {
        let _guard = InFlight::enter(self);

        let sender = self
            .requests
            .lock()
            .clone()
            .ok_or_else(|| self.unavailable("worker is not accepting calls"))?;
        if !self.alive.load(Ordering::SeqCst) {
            return Err(self.unavailable("worker process has exited"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = HostMessage::Call {
            id,
            name: name.to_string(),
            args,
            kwargs,
        };
        if sender.send(request).is_err() {
            self.pending.lock().remove(&id);
            return Err(self.unavailable("request channel closed"));
        }
        drop(sender);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Reply { error: Some(message), .. })) => Err(ActionError::Application {
                action: name.to_string(),
                message,
            }),
            Ok(Ok(Reply { result, .. })) => Ok(result),
            Ok(Err(_)) => Err(self.unavailable("worker exited before replying")),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(self.unavailable(&format!("no reply within {:?}", timeout)))
            }
        }
    }

    /// Stop the worker.
    ///
    /// With calls in flight the request channel is closed and the process is
    /// joined once it has drained its queue; otherwise it is killed outright.
    /// Returns once no call is in flight.
    pub async fn shutdown(&self) {
        let in_flight = self.in_flight();
        self.terminating.store(true, Ordering::SeqCst);
        self.set_status(WorkerStatus::Terminating);
        self.requests.lock().take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if in_flight > 0 {
                info!(
                    "Draining worker {} ({} calls in flight)",
                    self.module, in_flight
                );
                match child.wait().await {
                    Ok(status) => info!("Worker {} exited: {}", self.module, status),
                    Err(e) => warn!("Failed to join worker {}: {}", self.module, e),
                }
            } else {
                match child.kill().await {
                    Ok(()) => info!("Worker {} killed", self.module),
                    Err(e) => warn!("Failed to kill worker {}: {}", self.module, e),
                }
            }
        }

        self.wait_idle().await;
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn unavailable(&self, reason: &str) -> ActionError {
        ActionError::WorkerUnavailable {
            module: self.module.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Counts a call as in flight for as long as it is alive.
struct InFlight<'a>(&'a WorkerHandle);

impl<'a> InFlight<'a> {
    fn enter(handle: &'a WorkerHandle) -> Self {
        handle.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(handle)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
