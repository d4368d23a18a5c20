//! Orchestrator: lazy service construction and the reconciliation loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conductor_cluster::{ClusterApi, Reconciler};
use conductor_core::{deep_merge, ConductorConfig, Error, Result};
use conductor_manifest::ResolvedManifest;

use crate::hooks::{ExitSupervisor, NoopTickHook, Supervisor, TickHook};
use crate::queue::RegenerationQueue;
use crate::registry::{ContextBuilder, ContextRegistry, ServiceRegistry};
use crate::store::StateStore;
use crate::types::*;

const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the service and context registries, cached instances, the
/// regeneration queue and the collaborators the control loop drives.
pub struct Orchestrator {
    config: ConductorConfig,
    services: ServiceRegistry,
    contexts: ContextRegistry,
    instances: RwLock<HashMap<String, ServiceInstance>>,
    queue: RegenerationQueue,
    store: Arc<dyn StateStore>,
    cluster: Arc<dyn ClusterApi>,
    hook: Arc<dyn TickHook>,
    supervisor: Arc<dyn Supervisor>,
    busy: AtomicBool,
    build_lock: tokio::sync::Mutex<()>,
    bootstrap_interval: Duration,
}

impl Orchestrator {
    /// Create an orchestrator. Services named in `config.preload` are queued.
    pub fn new(
        config: ConductorConfig,
        store: Arc<dyn StateStore>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        let queue = RegenerationQueue::new();
        for name in &config.preload {
            queue.push(name);
        }
        info!(
            "Orchestrator initialized: namespace={}, tick={:?}, {} preloaded",
            config.namespace,
            config.tick_interval(),
            queue.len()
        );

        Self {
            config,
            services: ServiceRegistry::new(),
            contexts: ContextRegistry::new(),
            instances: RwLock::new(HashMap::new()),
            queue,
            store,
            cluster,
            hook: Arc::new(NoopTickHook),
            supervisor: Arc::new(ExitSupervisor),
            busy: AtomicBool::new(false),
            build_lock: tokio::sync::Mutex::new(()),
            bootstrap_interval: BOOTSTRAP_INTERVAL,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn TickHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Delay between datastore bootstrap attempts.
    pub fn with_bootstrap_interval(mut self, interval: Duration) -> Self {
        self.bootstrap_interval = interval;
        self
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn queue(&self) -> &RegenerationQueue {
        &self.queue
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Add a service builder. Re-registering a name is an override: the
    /// highest priority wins, then the latest registration.
    pub fn register(&self, registration: Registration) -> Arc<ServiceDescriptor> {
        self.services.register(registration)
    }

    pub fn register_context(&self, name: &str, builder: Arc<dyn ContextBuilder>, priority: i32) {
        self.contexts.register(name, builder, priority);
    }

    pub fn build_context(&self, name: &str, config: &Value) -> Result<Value> {
        self.contexts.build(name, config)
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.lookup(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.names()
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Cached instance, without building.
    pub fn instance(&self, name: &str) -> Option<ServiceInstance> {
        self.instances.read().get(name).cloned()
    }

    /// Cached instance, or a freshly built one.
    ///
    /// Build failures are not errors here: the returned instance is marked
    /// failed and the service is queued for regeneration. Only an unknown
    /// name is an error.
    pub async fn get(&self, name: &str) -> Result<ServiceInstance> {
        if let Some(instance) = self.instance(name) {
            return Ok(instance);
        }
        let _building = self.build_lock.lock().await;
        if let Some(instance) = self.instance(name) {
            return Ok(instance);
        }

        let descriptor = self
            .services
            .lookup(name)
            .ok_or_else(|| Error::NotFound(format!("service {}", name)))?;
        let instance = self.build(&descriptor).await;
        if instance.state == ServiceState::Failed {
            self.queue.push(name);
        }
        self.instances
            .write()
            .insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    /// Drop the cached instance and build a new one.
    pub async fn reset(&self, name: &str) -> Result<ServiceInstance> {
        self.instances.write().remove(name);
        self.get(name).await
    }

    /// Drop the cached instance. Returns whether one existed.
    pub fn destroy(&self, name: &str) -> bool {
        self.instances.write().remove(name).is_some()
    }

    /// Mark `name` for rebuild on the next tick.
    pub fn request_restart(&self, name: &str) -> Result<()> {
        if !self.services.contains(name) {
            return Err(Error::NotFound(format!("service {}", name)));
        }
        {
            let mut instances = self.instances.write();
            if let Some(current) = instances.get(name) {
                let mut next = current.clone();
                next.state = ServiceState::RestartRequested;
                instances.insert(name.to_string(), next);
            }
        }
        self.queue.push(name);
        info!("Restart requested for {}", name);
        Ok(())
    }

    /// Live service handle, building it if needed.
    ///
    /// Proxy-eligible services that are not running yield a stand-in that
    /// does nothing; others yield `None`.
    pub async fn svc(&self, name: &str) -> Option<Arc<dyn Service>> {
        let instance = match self.get(name).await {
            Ok(instance) => instance,
            Err(e) => {
                debug!("No service {}: {}", name, e);
                return None;
            }
        };
        if instance.is_running() {
            if let Some(handle) = instance.handle {
                return Some(handle);
            }
        }
        match self.services.lookup(name) {
            Some(descriptor) if descriptor.proxy => Some(Arc::new(StandInService::new(name))),
            _ => None,
        }
    }

    async fn build(&self, descriptor: &ServiceDescriptor) -> ServiceInstance {
        let name = descriptor.name.as_str();
        let config = self.service_config(&descriptor.config_key);
        let namespace = self.effective_namespace(descriptor, &config);
        let mut instance = ServiceInstance::new(name, config, namespace);

        if let Some(key) = &descriptor.manifest_key {
            if self.cluster.is_available().await {
                match self.resolve_manifest(key, &instance.config, &instance.namespace) {
                    Ok((manifest, values)) => {
                        instance.manifest = Some(manifest);
                        instance.resolved_values = values;
                    }
                    Err(e) => {
                        error!("Failed to resolve manifest {} for {}: {}", key, name, e);
                        return instance.failed(e.to_string());
                    }
                }
            } else {
                debug!("Cluster unavailable, building {} without manifest", name);
            }
        }

        instance.state = ServiceState::Initializing;
        let ctx = ServiceContext {
            name,
            config: &instance.config,
            namespace: &instance.namespace,
            manifest: instance.manifest.as_ref(),
            contexts: &self.contexts,
        };
        match descriptor.builder.build(&ctx).await {
            Ok(handle) => {
                info!("Service {} running", name);
                instance.handle = Some(handle);
                instance.state = ServiceState::Running;
                instance
            }
            Err(e) => {
                error!("Failed to build service {}: {}", name, e);
                instance.failed(e.to_string())
            }
        }
    }

    /// Static default config merged with the persisted override.
    pub fn service_config(&self, config_key: &str) -> Value {
        let mut config = self.config.service_default(config_key);
        match self.store.get_config(config_key) {
            Ok(Some(overlay)) => deep_merge(&mut config, &overlay),
            Ok(None) => {}
            Err(e) => warn!("Failed to read config override for {}: {}", config_key, e),
        }
        config
    }

    fn effective_namespace(&self, descriptor: &ServiceDescriptor, config: &Value) -> String {
        match descriptor.manifest_kind {
            ManifestKind::Dedicated => dns_label(&descriptor.name),
            ManifestKind::Manual => config
                .get("namespace")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.config.namespace.clone()),
            ManifestKind::Source => self.config.namespace.clone(),
        }
    }

    fn resolve_manifest(
        &self,
        key: &str,
        config: &Value,
        namespace: &str,
    ) -> Result<(ResolvedManifest, BTreeMap<String, Value>)> {
        let dir = self
            .config
            .manifest_dir(key)
            .ok_or_else(|| Error::Config("manifest_root is not set".into()))?;

        let mut overrides = match config {
            Value::Object(_) => config.clone(),
            _ => json!({}),
        };
        if let Some(map) = overrides.as_object_mut() {
            map.entry("namespace").or_insert_with(|| json!(namespace));
        }

        let resolution = conductor_manifest::resolve(&dir, &overrides)?;
        let mut manifest = ResolvedManifest::from_rendered(&resolution.files)?;
        Reconciler::prepare(&mut manifest, namespace);
        Ok((manifest, resolution.values))
    }

    fn unsafe_unlocked(&self, config: &Value) -> bool {
        let supplied = config.get("unsafe_passphrase").and_then(Value::as_str);
        match (supplied, self.config.unsafe_passphrase.as_deref()) {
            (Some(supplied), Some(expected)) => supplied == expected,
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Control loop
    // ------------------------------------------------------------------

    /// Spawn the control loop. The next pass is scheduled only after the
    /// previous one finished.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                this.tick().await;
                tokio::time::sleep(this.config.tick_interval()).await;
            }
        })
    }

    /// Run one reconciliation pass unless one is already running.
    ///
    /// If the state store is unreachable this applies the datastore
    /// bootstrap manifest until it answers, then restarts the process and
    /// never returns.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Tick already in progress, skipping");
            return TickOutcome::Skipped;
        }
        let _busy = BusyGuard(&self.busy);

        if let Err(e) = self.store.ping() {
            error!("State store unreachable: {}", e);
            self.await_datastore().await;
            self.supervisor.restart();
        }

        let mut report = TickReport::default();
        for name in self.queue.snapshot() {
            self.regenerate(&name, &mut report).await;
        }
        report.remaining = self.queue.len();

        self.hook.after_tick(&report).await;
        TickOutcome::Completed(report)
    }

    async fn await_datastore(&self) {
        loop {
            match &self.config.datastore_manifest {
                Some(key) => self.apply_datastore_manifest(key).await,
                None => warn!("No datastore manifest configured, waiting for state store"),
            }
            tokio::time::sleep(self.bootstrap_interval).await;
            if self.store.ping().is_ok() {
                info!("State store reachable again");
                return;
            }
        }
    }

    async fn apply_datastore_manifest(&self, key: &str) {
        let config = self.config.service_default(key);
        let namespace = self.config.namespace.clone();
        match self.resolve_manifest(key, &config, &namespace) {
            Ok((manifest, _)) => {
                Reconciler::new(self.cluster.as_ref(), &self.config.unsafe_kinds)
                    .apply(&namespace, &manifest, None)
                    .await;
            }
            Err(e) => error!("Failed to resolve datastore manifest {}: {}", key, e),
        }
    }

    async fn regenerate(&self, name: &str, report: &mut TickReport) {
        let Some(descriptor) = self.services.lookup(name) else {
            warn!("Dropping unknown service {} from queue", name);
            self.queue.remove(name);
            return;
        };
        if self.instance(name).is_some_and(|i| i.is_running()) {
            self.queue.remove(name);
            return;
        }

        let config = self.service_config(&descriptor.config_key);
        if !flag(&config, "enabled") || !flag(&config, "automation") {
            debug!("Service {} is disabled or not automated, skipping", name);
            report.skipped.push(name.to_string());
            return;
        }

        if let Some(key) = &descriptor.manifest_key {
            if !self.cluster.is_available().await {
                warn!("Cluster unavailable, deferring {}", name);
                report.skipped.push(name.to_string());
                return;
            }
            let namespace = self.effective_namespace(&descriptor, &config);
            let (manifest, values) = match self.resolve_manifest(key, &config, &namespace) {
                Ok(resolved) => resolved,
                Err(e) => {
                    error!("Failed to resolve manifest {} for {}: {}", key, name, e);
                    report.skipped.push(name.to_string());
                    return;
                }
            };

            let previous = self.store.get_history(key).unwrap_or_else(|e| {
                warn!("Failed to read manifest history for {}: {}", key, e);
                None
            });
            let applied = Reconciler::new(self.cluster.as_ref(), &self.config.unsafe_kinds)
                .allow_unsafe(self.unsafe_unlocked(&config))
                .apply(&namespace, &manifest, previous.as_ref())
                .await;

            if previous.as_ref() != Some(&manifest) {
                if let Err(e) = self.store.put_history(key, &manifest) {
                    error!("Failed to persist manifest history for {}: {}", key, e);
                }
            }
            if let Err(e) = self.store.put_resolved(key, &values) {
                warn!("Failed to persist resolved values for {}: {}", key, e);
            }
            report.reconciled.insert(name.to_string(), applied);
        }

        match self.reset(name).await {
            Ok(instance) if instance.is_running() => {
                self.queue.remove(name);
            }
            Ok(instance) => debug!("Service {} still {:?}", name, instance.state),
            Err(e) => error!("Failed to rebuild {}: {}", name, e),
        }
        report.rebuilt.push(name.to_string());
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Boolean service flag, defaulting to true.
fn flag(config: &Value, field: &str) -> bool {
    config.get(field).and_then(Value::as_bool).unwrap_or(true)
}

/// Lowercase RFC 1123 label derived from a service name.
fn dns_label(name: &str) -> String {
    let label: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    label.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use conductor_cluster::{ClusterOp, MemoryCluster, ResourceRef};

    use crate::store::MemoryStateStore;

    struct Dummy {
        name: String,
        tag: &'static str,
    }

    impl Service for Dummy {
        fn name(&self) -> &str {
            &self.name
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct TagBuilder {
        tag: &'static str,
        builds: AtomicUsize,
        fail: AtomicBool,
    }

    impl TagBuilder {
        fn new(tag: &'static str) -> Arc<Self> {
            Arc::new(Self {
                tag,
                builds: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ServiceBuilder for TagBuilder {
        async fn build(&self, ctx: &ServiceContext<'_>) -> Result<Arc<dyn Service>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Service("boom".into()));
            }
            Ok(Arc::new(Dummy {
                name: ctx.name.to_string(),
                tag: self.tag,
            }))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStateStore>,
        cluster: Arc<MemoryCluster>,
        orch: Orchestrator,
    }

    fn write(dir: &Path, rel: &str, text: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    fn fixture(edit: impl FnOnce(&mut ConductorConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConductorConfig::default();
        config.namespace = "conductor".into();
        config.manifest_root = Some(dir.path().to_path_buf());
        edit(&mut config);
        let store = Arc::new(MemoryStateStore::new());
        let cluster = Arc::new(MemoryCluster::new());
        let orch = Orchestrator::new(config, store.clone(), cluster.clone());
        Fixture {
            _dir: dir,
            store,
            cluster,
            orch,
        }
    }

    const CACHE_MANIFEST: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: cache
spec:
  replicas: $g{replicas:1}
---
apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: cache-data
spec:
  storage: $g{storage:1Gi}
";

    fn with_manifest(fx: &Fixture, key: &str, text: &str) {
        write(fx._dir.path(), &format!("{}/main.yaml", key), text);
    }

    #[tokio::test]
    async fn test_priority_selects_builder() {
        let fx = fixture(|_| {});
        fx.orch
            .register(Registration::new("db", TagBuilder::new("high")).priority(10));
        fx.orch
            .register(Registration::new("db", TagBuilder::new("low")).priority(1));

        let instance = fx.orch.get("db").await.unwrap();
        assert!(instance.is_running());
        assert_eq!(instance.handle_as::<Dummy>().unwrap().tag, "high");
    }

    #[tokio::test]
    async fn test_get_caches_instance() {
        let fx = fixture(|_| {});
        let builder = TagBuilder::new("a");
        fx.orch.register(Registration::new("db", builder.clone()));

        fx.orch.get("db").await.unwrap();
        fx.orch.get("db").await.unwrap();
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);

        fx.orch.reset("db").await.unwrap();
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);

        assert!(fx.orch.destroy("db"));
        assert!(!fx.orch.destroy("db"));
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let fx = fixture(|_| {});
        assert!(matches!(fx.orch.get("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_build_failure_queues_service() {
        let fx = fixture(|_| {});
        let builder = TagBuilder::new("a");
        builder.fail.store(true, Ordering::SeqCst);
        fx.orch.register(Registration::new("db", builder.clone()));

        let instance = fx.orch.get("db").await.unwrap();
        assert_eq!(instance.state, ServiceState::Failed);
        assert_eq!(instance.error.as_deref(), Some("Service error: boom"));
        assert!(fx.orch.queue().contains("db"));

        builder.fail.store(false, Ordering::SeqCst);
        let TickOutcome::Completed(report) = fx.orch.tick().await else {
            panic!("tick skipped");
        };
        assert_eq!(report.rebuilt, vec!["db"]);
        assert!(fx.orch.instance("db").unwrap().is_running());
        assert!(fx.orch.queue().is_empty());
    }

    #[tokio::test]
    async fn test_config_override_merges_over_default() {
        let fx = fixture(|c| {
            c.services
                .insert("db".into(), json!({"replicas": 1, "image": {"tag": "1"}}));
        });
        fx.store
            .put_config("db", &json!({"image": {"tag": "2"}}))
            .unwrap();
        fx.orch.register(Registration::new("db", TagBuilder::new("a")));

        let instance = fx.orch.get("db").await.unwrap();
        assert_eq!(instance.config, json!({"replicas": 1, "image": {"tag": "2"}}));
    }

    #[tokio::test]
    async fn test_get_resolves_manifest_with_namespace() {
        let fx = fixture(|c| {
            c.services.insert("cache".into(), json!({"replicas": 3}));
        });
        with_manifest(&fx, "cache", CACHE_MANIFEST);
        fx.orch.register(
            Registration::new("cache", TagBuilder::new("a")).manifest("cache", ManifestKind::Dedicated),
        );

        let instance = fx.orch.get("cache").await.unwrap();
        assert_eq!(instance.namespace, "cache");
        let manifest = instance.manifest.unwrap();
        let deploy = manifest.get("Deployment", "cache").unwrap();
        assert_eq!(deploy["spec"]["replicas"], json!(3));
        assert_eq!(deploy["metadata"]["namespace"], json!("cache"));
        assert_eq!(instance.resolved_values["storage"], json!("1Gi"));
    }

    #[tokio::test]
    async fn test_manual_and_source_namespaces() {
        let fx = fixture(|c| {
            c.services.insert("manual".into(), json!({"namespace": "team-a"}));
        });
        fx.orch.register(
            Registration::new("manual", TagBuilder::new("a")).manifest("none", ManifestKind::Manual),
        );
        fx.orch.register(
            Registration::new("shared", TagBuilder::new("a")).manifest("none", ManifestKind::Source),
        );
        fx.cluster.set_available(false);

        assert_eq!(fx.orch.get("manual").await.unwrap().namespace, "team-a");
        assert_eq!(fx.orch.get("shared").await.unwrap().namespace, "conductor");
    }

    #[tokio::test]
    async fn test_tick_reconciles_and_records_history() {
        let fx = fixture(|c| c.preload = vec!["cache".into()]);
        with_manifest(&fx, "cache", CACHE_MANIFEST);
        fx.orch.register(
            Registration::new("cache", TagBuilder::new("a")).manifest("cache", ManifestKind::Dedicated),
        );

        let TickOutcome::Completed(report) = fx.orch.tick().await else {
            panic!("tick skipped");
        };
        let applied = &report.reconciled["cache"];
        assert_eq!(applied.created.len(), 3);
        assert!(fx.cluster.get(&ResourceRef::namespace_ref("cache")).is_some());
        assert!(fx.store.get_history("cache").unwrap().is_some());
        assert_eq!(
            fx.store.get_resolved("cache").unwrap().unwrap()["replicas"],
            json!(1)
        );
        assert!(fx.orch.queue().is_empty());
        assert!(fx.orch.instance("cache").unwrap().is_running());
    }

    #[tokio::test]
    async fn test_restart_reapplies_changes_and_guards_unsafe_delete() {
        let fx = fixture(|_| {});
        with_manifest(&fx, "cache", CACHE_MANIFEST);
        fx.orch.register(
            Registration::new("cache", TagBuilder::new("a")).manifest("cache", ManifestKind::Dedicated),
        );
        fx.orch.request_restart("cache").unwrap();
        fx.orch.tick().await;
        fx.cluster.clear_ops();

        // drop the claim and bump replicas
        with_manifest(
            &fx,
            "cache",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: cache\nspec:\n  replicas: 2\n",
        );
        fx.orch.request_restart("cache").unwrap();
        assert_eq!(
            fx.orch.instance("cache").unwrap().state,
            ServiceState::RestartRequested
        );

        let TickOutcome::Completed(report) = fx.orch.tick().await else {
            panic!("tick skipped");
        };
        let applied = &report.reconciled["cache"];
        assert_eq!(applied.patched.len(), 1);
        assert!(applied.deleted.is_empty());
        assert_eq!(applied.skipped_unsafe.len(), 1);
        assert!(!fx
            .cluster
            .ops()
            .iter()
            .any(|op| matches!(op, ClusterOp::Delete(_))));
    }

    #[tokio::test]
    async fn test_passphrase_unlocks_unsafe_delete() {
        let fx = fixture(|c| {
            c.unsafe_passphrase = Some("yes-really".into());
            c.services
                .insert("cache".into(), json!({"unsafe_passphrase": "yes-really"}));
        });
        with_manifest(&fx, "cache", CACHE_MANIFEST);
        fx.orch.register(
            Registration::new("cache", TagBuilder::new("a")).manifest("cache", ManifestKind::Dedicated),
        );
        fx.orch.request_restart("cache").unwrap();
        fx.orch.tick().await;

        with_manifest(
            &fx,
            "cache",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: cache\nspec:\n  replicas: 1\n",
        );
        fx.orch.request_restart("cache").unwrap();
        let TickOutcome::Completed(report) = fx.orch.tick().await else {
            panic!("tick skipped");
        };
        assert_eq!(report.reconciled["cache"].deleted.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_service_stays_queued() {
        let fx = fixture(|c| {
            c.preload = vec!["db".into()];
            c.services.insert("db".into(), json!({"enabled": false}));
        });
        let builder = TagBuilder::new("a");
        fx.orch.register(Registration::new("db", builder.clone()));

        let TickOutcome::Completed(report) = fx.orch.tick().await else {
            panic!("tick skipped");
        };
        assert_eq!(report.skipped, vec!["db"]);
        assert_eq!(report.remaining, 1);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let fx = fixture(|_| {});
        fx.orch.busy.store(true, Ordering::SeqCst);
        assert!(matches!(fx.orch.tick().await, TickOutcome::Skipped));
        fx.orch.busy.store(false, Ordering::SeqCst);
        assert!(matches!(fx.orch.tick().await, TickOutcome::Completed(_)));
        assert!(!fx.orch.busy.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_svc_stand_in_for_proxy_services() {
        let fx = fixture(|_| {});
        let broken = TagBuilder::new("a");
        broken.fail.store(true, Ordering::SeqCst);
        fx.orch
            .register(Registration::new("search", broken.clone()).proxy(true));
        let other = TagBuilder::new("b");
        other.fail.store(true, Ordering::SeqCst);
        fx.orch.register(Registration::new("mail", other));
        fx.orch
            .register(Registration::new("live", TagBuilder::new("c")));

        let stand_in = fx.orch.svc("search").await.unwrap();
        assert!(!stand_in.is_live());
        assert!(fx.orch.svc("mail").await.is_none());
        assert!(fx.orch.svc("live").await.unwrap().is_live());
        assert!(fx.orch.svc("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_context_registry_reaches_builders() {
        struct CtxBuilder;

        #[async_trait]
        impl ServiceBuilder for CtxBuilder {
            async fn build(&self, ctx: &ServiceContext<'_>) -> Result<Arc<dyn Service>> {
                let value = ctx.contexts.build("greeting", ctx.config)?;
                let tag = if value == json!("hi") { "ok" } else { "bad" };
                Ok(Arc::new(Dummy {
                    name: ctx.name.to_string(),
                    tag,
                }))
            }
        }

        let fx = fixture(|_| {});
        fx.orch.register_context(
            "greeting",
            Arc::new(|_: &Value| -> Result<Value> { Ok(json!("hi")) }),
            0,
        );
        fx.orch.register(Registration::new("greeter", Arc::new(CtxBuilder)));
        let instance = fx.orch.get("greeter").await.unwrap();
        assert_eq!(instance.handle_as::<Dummy>().unwrap().tag, "ok");
    }

    struct RecordingSupervisor {
        restarts: AtomicUsize,
    }

    impl Supervisor for RecordingSupervisor {
        fn restart(&self) -> ! {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            panic!("restart");
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_bootstraps_then_restarts() {
        let fx = fixture(|c| {
            c.datastore_manifest = Some("datastore".into());
            c.services.insert("datastore".into(), json!({"image": "pg:16"}));
        });
        with_manifest(
            &fx,
            "datastore",
            "apiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: pg\nspec:\n  image: $g{image}\n",
        );
        let supervisor = Arc::new(RecordingSupervisor {
            restarts: AtomicUsize::new(0),
        });
        let Fixture {
            _dir,
            store,
            cluster,
            orch,
        } = fx;
        let orch = Arc::new(
            orch.with_supervisor(supervisor.clone())
                .with_bootstrap_interval(Duration::from_millis(20)),
        );
        store.set_reachable(false);

        let running = tokio::spawn({
            let orch = orch.clone();
            async move {
                orch.tick().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pg = ResourceRef::new("apps/v1", "StatefulSet", "pg", Some("conductor"));
        assert_eq!(cluster.get(&pg).unwrap()["spec"]["image"], json!("pg:16"));
        assert_eq!(supervisor.restarts.load(Ordering::SeqCst), 0);

        store.set_reachable(true);
        let outcome = running.await;
        assert!(outcome.unwrap_err().is_panic());
        assert_eq!(supervisor.restarts.load(Ordering::SeqCst), 1);
    }

    struct RecordingHook {
        passes: parking_lot::Mutex<Vec<(tokio::time::Instant, TickReport)>>,
    }

    #[async_trait]
    impl TickHook for RecordingHook {
        async fn after_tick(&self, report: &TickReport) {
            self.passes
                .lock()
                .push((tokio::time::Instant::now(), report.clone()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_rearms_after_each_pass() {
        let fx = fixture(|c| {
            c.tick_interval_secs = 5;
            c.min_tick_interval_secs = 1;
        });
        let interval = fx.orch.config().tick_interval();
        assert_eq!(interval, Duration::from_secs(5));

        let builder = TagBuilder::new("a");
        let hook = Arc::new(RecordingHook {
            passes: parking_lot::Mutex::new(Vec::new()),
        });
        let Fixture { _dir, orch, .. } = fx;
        let orch = Arc::new(orch.with_hook(hook.clone()));
        orch.register(Registration::new("db", builder.clone()));
        orch.queue().push("db");

        let control_loop = orch.start();
        while hook.passes.lock().len() < 3 {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        control_loop.abort();

        let passes = hook.passes.lock().clone();
        assert_eq!(passes[0].1.rebuilt, vec!["db".to_string()]);
        assert_eq!(passes[0].1.remaining, 0);
        assert!(passes[1].1.rebuilt.is_empty());
        assert!(passes[2].1.rebuilt.is_empty());
        for pair in passes.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= interval);
        }
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_interval_has_floor() {
        let fx = fixture(|c| {
            c.tick_interval_secs = 0;
            c.min_tick_interval_secs = 2;
        });
        let hook = Arc::new(RecordingHook {
            passes: parking_lot::Mutex::new(Vec::new()),
        });
        let orch = Arc::new(fx.orch.with_hook(hook.clone()));

        let control_loop = orch.start();
        while hook.passes.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        control_loop.abort();

        let passes = hook.passes.lock().clone();
        assert!(passes[1].0 - passes[0].0 >= Duration::from_secs(2));
    }

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("Vector_Store"), "vector-store");
        assert_eq!(dns_label("ner.svc"), "ner-svc");
    }
}
