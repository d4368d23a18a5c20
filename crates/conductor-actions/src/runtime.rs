//! The action runtime: binding table, module pool and dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::pool::{WorkerHandle, WorkerLauncher, WorkerStatus};
use crate::remote::{self, RemoteEndpoint};
use crate::types::{
    ActionBinding, ActionError, ActionInfo, ActionTarget, Args, Kwargs, LocalFn,
};

type BindingTable = HashMap<String, ActionBinding>;

/// Registry of callable actions.
///
/// Reads go through an [`ArcSwap`] snapshot and never lock. Every mutation
/// clones the table, edits the clone and swaps it in while holding
/// `write_lock`, so concurrent readers see either the old or the new set.
pub struct ActionRuntime {
    bindings: ArcSwap<BindingTable>,
    write_lock: Mutex<()>,
    workers: Mutex<HashMap<String, Arc<WorkerHandle>>>,
    launcher: Arc<dyn WorkerLauncher>,
    client: Client,
    call_timeout: Duration,
    context: Value,
}

impl ActionRuntime {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, call_timeout: Duration) -> Self {
        Self {
            bindings: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            workers: Mutex::new(HashMap::new()),
            launcher,
            client: Client::new(),
            call_timeout,
            context: Value::Null,
        }
    }

    /// Context handed to module setup hooks by [`load_module`](Self::load_module).
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    // ------------------------------------------------------------------
    // Binding table
    // ------------------------------------------------------------------

    fn publish(&self, bindings: impl IntoIterator<Item = ActionBinding>) -> usize {
        let _writer = self.write_lock.lock();
        let mut table: BindingTable = (**self.bindings.load()).clone();
        let mut count = 0;
        for binding in bindings {
            if let Some(previous) = table.insert(binding.name.clone(), binding) {
                debug!("Rebinding action {}", previous.name);
            }
            count += 1;
        }
        self.bindings.store(Arc::new(table));
        count
    }

    fn retract(&self, matches: impl Fn(&ActionBinding) -> bool) -> Vec<ActionBinding> {
        let _writer = self.write_lock.lock();
        let mut table: BindingTable = (**self.bindings.load()).clone();
        let names: Vec<String> = table
            .values()
            .filter(|b| matches(b))
            .map(|b| b.name.clone())
            .collect();
        if names.is_empty() {
            return Vec::new();
        }
        let removed = names.iter().filter_map(|n| table.remove(n)).collect();
        self.bindings.store(Arc::new(table));
        removed
    }

    /// Publish an in-process action.
    pub fn register_local<F>(&self, name: &str, f: F)
    where
        F: Fn(&[Value], &Kwargs) -> Result<Value, String> + Send + Sync + 'static,
    {
        let target: LocalFn = Arc::new(f);
        self.publish([ActionBinding {
            name: name.to_string(),
            target: ActionTarget::Local(target),
        }]);
        debug!("Registered local action {}", name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.load().contains_key(name)
    }

    pub fn list_actions(&self) -> Vec<ActionInfo> {
        let table = self.bindings.load();
        let mut infos: Vec<ActionInfo> = table
            .values()
            .map(|b| ActionInfo {
                name: b.name.clone(),
                kind: b.kind(),
                module: b.module().map(str::to_string),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    pub async fn invoke(
        &self,
        name: &str,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<Value, ActionError> {
        let binding = self
            .bindings
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| ActionError::NotFound(name.to_string()))?;

        match binding.target {
            ActionTarget::Local(f) => f(&args, &kwargs).map_err(|message| ActionError::Application {
                action: name.to_string(),
                message,
            }),
            ActionTarget::Worker(handle) => {
                handle.call(name, args, kwargs, self.call_timeout).await
            }
            ActionTarget::Remote { endpoint, params } => {
                endpoint
                    .call(name, &params, &args, &kwargs, self.call_timeout)
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker modules
    // ------------------------------------------------------------------

    /// Load `module` into a worker with the runtime's default context.
    pub async fn load_module(&self, module: &str) -> bool {
        let context = self.context.clone();
        self.load_module_with(module, &context).await
    }

    /// Load `module` into a dedicated worker process.
    ///
    /// Returns `false` while another load of the same module is still in
    /// its handshake, while a previous worker is still draining, or when the
    /// worker could not be started. Callers retry later.
    pub async fn load_module_with(&self, module: &str, context: &Value) -> bool {
        let stale = {
            let mut workers = self.workers.lock();
            match workers.get(module).cloned() {
                Some(existing) if existing.is_terminating() => {
                    if existing.in_flight() > 0 {
                        info!("Module {} is still draining, load deferred", module);
                        return false;
                    }
                    workers.remove(module);
                    Some(existing)
                }
                Some(existing) => {
                    if existing.status() == WorkerStatus::Ready {
                        return true;
                    }
                    debug!("Module {} is already initializing", module);
                    return false;
                }
                None => None,
            }
        };
        if let Some(stale) = stale {
            let removed = self.retract(|b| match &b.target {
                ActionTarget::Worker(h) => Arc::ptr_eq(h, &stale),
                _ => false,
            });
            debug!(
                "Released stale worker for {} ({} actions)",
                module,
                removed.len()
            );
            stale.shutdown().await;
        }

        let handle = {
            let mut workers = self.workers.lock();
            if workers.contains_key(module) {
                return false;
            }
            let handle = WorkerHandle::new(module);
            workers.insert(module.to_string(), handle.clone());
            handle
        };

        info!("Loading module {}", module);
        match handle.start(self.launcher.as_ref(), context).await {
            Ok(actions) => {
                let count = self.publish(actions.into_iter().map(|name| ActionBinding {
                    name,
                    target: ActionTarget::Worker(handle.clone()),
                }));
                handle.set_status(WorkerStatus::Ready);
                info!("Module {} ready ({} actions)", module, count);
                true
            }
            Err(e) => {
                error!("Failed to load module {}: {}", module, e);
                self.forget_worker(module, &handle);
                false
            }
        }
    }

    /// Stop the worker for `module` and drop its bindings.
    ///
    /// Calls already in flight are answered before the process goes away.
    /// Returns `false` if the module is not loaded or still initializing.
    pub async fn unload_module(&self, module: &str) -> bool {
        let handle = self.workers.lock().get(module).cloned();
        let Some(handle) = handle else {
            return false;
        };
        if handle.status() == WorkerStatus::Initializing {
            warn!("Module {} is initializing, unload refused", module);
            return false;
        }

        let removed = self.retract(|b| match &b.target {
            ActionTarget::Worker(h) => Arc::ptr_eq(h, &handle),
            _ => false,
        });
        handle.shutdown().await;
        self.forget_worker(module, &handle);
        info!("Module {} unloaded ({} actions removed)", module, removed.len());
        true
    }

    /// Remove one binding. Returns `false` if it was not bound.
    pub async fn unload_action(&self, name: &str) -> bool {
        let removed = self.retract(|b| b.name == name);
        if removed.is_empty() {
            return false;
        }
        self.release_orphaned_modules(&removed).await;
        true
    }

    /// Remove every binding under `prefix.` and return how many were removed.
    pub async fn unload_action_set(&self, prefix: &str) -> usize {
        let scope = format!("{}.", prefix.trim_end_matches('.'));
        let removed = self.retract(|b| b.name.starts_with(&scope));
        self.release_orphaned_modules(&removed).await;
        removed.len()
    }

    async fn release_orphaned_modules(&self, removed: &[ActionBinding]) {
        let mut modules: Vec<&str> = removed.iter().filter_map(|b| b.module()).collect();
        modules.sort_unstable();
        modules.dedup();
        for module in modules {
            let still_bound = self
                .bindings
                .load()
                .values()
                .any(|b| b.module() == Some(module));
            if !still_bound {
                info!("Last action of module {} removed", module);
                self.unload_module(module).await;
            }
        }
    }

    fn forget_worker(&self, module: &str, handle: &Arc<WorkerHandle>) {
        let mut workers = self.workers.lock();
        if workers.get(module).is_some_and(|h| Arc::ptr_eq(h, handle)) {
            workers.remove(module);
        }
    }

    pub fn worker(&self, module: &str) -> Option<Arc<WorkerHandle>> {
        self.workers.lock().get(module).cloned()
    }

    pub fn loaded_modules(&self) -> Vec<(String, WorkerStatus)> {
        let mut modules: Vec<_> = self
            .workers
            .lock()
            .iter()
            .map(|(name, h)| (name.clone(), h.status()))
            .collect();
        modules.sort_by(|a, b| a.0.cmp(&b.0));
        modules
    }

    /// Unload every worker module.
    pub async fn shutdown(&self) {
        let modules: Vec<String> = self.workers.lock().keys().cloned().collect();
        for module in modules {
            self.unload_module(&module).await;
        }
    }

    // ------------------------------------------------------------------
    // Remote endpoints
    // ------------------------------------------------------------------

    /// Discover and bind the actions served at `base_url`.
    ///
    /// Setup actions are run once with `context` when it is a non-empty
    /// object. Their failures are logged and do not fail the load.
    pub async fn load_remote(
        &self,
        base_url: &str,
        context: &Value,
    ) -> Result<Vec<String>, ActionError> {
        let endpoint = Arc::new(RemoteEndpoint::new(base_url, self.client.clone()));
        let spec = endpoint.discover().await?;
        let names: Vec<String> = spec.keys().cloned().collect();

        self.publish(spec.into_iter().map(|(name, params)| ActionBinding {
            name,
            target: ActionTarget::Remote {
                endpoint: endpoint.clone(),
                params,
            },
        }));
        info!("Bound {} remote actions from {}", names.len(), endpoint.base_url());

        if let Some(ctx) = context.as_object().filter(|c| !c.is_empty()) {
            for name in names.iter().filter(|n| remote::is_setup_action(n)) {
                match self.invoke(name, Vec::new(), ctx.clone()).await {
                    Ok(_) => debug!("Remote setup {} done", name),
                    Err(e) => warn!("Remote setup {} failed: {}", name, e),
                }
            }
        }

        Ok(names)
    }
}
