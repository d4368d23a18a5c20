//! Service registry types.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conductor_core::Result;
use conductor_manifest::ResolvedManifest;

use crate::registry::{ContextRegistry, Ranked};

/// How the namespace of a service's manifest is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    /// The service gets a namespace named after itself.
    Dedicated,
    /// The namespace comes from the service's `namespace` config field.
    Manual,
    /// Resources go into the orchestrator's own namespace.
    Source,
}

/// Lifecycle state of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Unbuilt,
    Initializing,
    Running,
    Failed,
    RestartRequested,
}

/// A live, built service.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// `false` for stand-ins that accept calls but do nothing.
    fn is_live(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any;
}

/// Everything a builder gets to construct a service.
pub struct ServiceContext<'a> {
    pub name: &'a str,
    /// Persisted override merged over the static default.
    pub config: &'a Value,
    pub namespace: &'a str,
    pub manifest: Option<&'a ResolvedManifest>,
    pub contexts: &'a ContextRegistry,
}

#[async_trait]
pub trait ServiceBuilder: Send + Sync {
    async fn build(&self, ctx: &ServiceContext<'_>) -> Result<Arc<dyn Service>>;
}

/// An immutable registration record.
pub struct ServiceDescriptor {
    pub name: String,
    pub builder: Arc<dyn ServiceBuilder>,
    pub config_key: String,
    pub manifest_key: Option<String>,
    pub manifest_kind: ManifestKind,
    pub priority: i32,
    pub proxy: bool,
    /// Registration order, used to break priority ties (newest wins).
    pub seq: u64,
    pub registered_at: DateTime<Utc>,
}

impl Ranked for ServiceDescriptor {
    fn name(&self) -> &str {
        &self.name
    }
    fn priority(&self) -> i32 {
        self.priority
    }
    fn seq(&self) -> u64 {
        self.seq
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("config_key", &self.config_key)
            .field("manifest_key", &self.manifest_key)
            .field("manifest_kind", &self.manifest_kind)
            .field("priority", &self.priority)
            .field("proxy", &self.proxy)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Arguments to [`Orchestrator::register`](crate::Orchestrator::register).
pub struct Registration {
    pub(crate) name: String,
    pub(crate) builder: Arc<dyn ServiceBuilder>,
    pub(crate) config_key: String,
    pub(crate) manifest_key: Option<String>,
    pub(crate) manifest_kind: ManifestKind,
    pub(crate) priority: i32,
    pub(crate) proxy: bool,
}

impl Registration {
    /// A registration with config key = `name`, no manifest, priority 0.
    pub fn new(name: &str, builder: Arc<dyn ServiceBuilder>) -> Self {
        Self {
            name: name.to_string(),
            builder,
            config_key: name.to_string(),
            manifest_key: None,
            manifest_kind: ManifestKind::Dedicated,
            priority: 0,
            proxy: false,
        }
    }

    pub fn config_key(mut self, key: &str) -> Self {
        self.config_key = key.to_string();
        self
    }

    pub fn manifest(mut self, key: &str, kind: ManifestKind) -> Self {
        self.manifest_key = Some(key.to_string());
        self.manifest_kind = kind;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Hand out a stand-in instead of nothing while the service is down.
    pub fn proxy(mut self, proxy: bool) -> Self {
        self.proxy = proxy;
        self
    }

    pub(crate) fn into_descriptor(self, seq: u64) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.name,
            builder: self.builder,
            config_key: self.config_key,
            manifest_key: self.manifest_key,
            manifest_kind: self.manifest_kind,
            priority: self.priority,
            proxy: self.proxy,
            seq,
            registered_at: Utc::now(),
        }
    }
}

/// A built (or failed) service. Replaced wholesale, never mutated in place.
#[derive(Clone)]
pub struct ServiceInstance {
    pub name: String,
    pub config: Value,
    pub namespace: String,
    pub manifest: Option<ResolvedManifest>,
    /// Value that took effect for every manifest placeholder key.
    pub resolved_values: BTreeMap<String, Value>,
    pub state: ServiceState,
    pub error: Option<String>,
    pub handle: Option<Arc<dyn Service>>,
}

impl ServiceInstance {
    pub(crate) fn new(name: &str, config: Value, namespace: String) -> Self {
        Self {
            name: name.to_string(),
            config,
            namespace,
            manifest: None,
            resolved_values: BTreeMap::new(),
            state: ServiceState::Unbuilt,
            error: None,
            handle: None,
        }
    }

    pub(crate) fn failed(mut self, error: String) -> Self {
        self.state = ServiceState::Failed;
        self.error = Some(error);
        self.handle = None;
        self
    }

    pub fn is_running(&self) -> bool {
        self.state == ServiceState::Running
    }

    /// Downcast the live handle.
    pub fn handle_as<T: Any>(&self) -> Option<&T> {
        self.handle.as_ref()?.as_any().downcast_ref::<T>()
    }
}

impl std::fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("state", &self.state)
            .field("error", &self.error)
            .finish()
    }
}

/// No-op stand-in returned for proxy-eligible services that are not running.
pub struct StandInService {
    name: String,
}

impl StandInService {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Service for StandInService {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_live(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Summary of one control-loop pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Services rebuilt this pass.
    pub rebuilt: Vec<String>,
    /// Reconciliation outcome per service with a manifest.
    pub reconciled: BTreeMap<String, conductor_cluster::ReconcileReport>,
    /// Queued services left alone (disabled, manual, or waiting on the cluster).
    pub skipped: Vec<String>,
    /// Queue length after the pass.
    pub remaining: usize,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another pass was already running.
    Skipped,
}
