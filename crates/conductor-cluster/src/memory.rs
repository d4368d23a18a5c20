//! In-process cluster: resources held in a map, every mutation recorded.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::api::{ClusterApi, ClusterError, ResourceRef};

/// A mutation applied to a [`MemoryCluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOp {
    Create(ResourceRef),
    Patch(ResourceRef),
    Delete(ResourceRef),
}

/// Cluster double keyed by (kind, namespace, name); `api_version` is not part of identity.
pub struct MemoryCluster {
    resources: RwLock<HashMap<(String, Option<String>, String), Value>>,
    ops: Mutex<Vec<ClusterOp>>,
    available: AtomicBool,
    failing_kinds: RwLock<HashSet<String>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
            ops: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            failing_kinds: RwLock::new(HashSet::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every call touching `kind` fail with an API error.
    pub fn fail_kind(&self, kind: &str) {
        self.failing_kinds.write().insert(kind.to_string());
    }

    /// Insert a resource directly, bypassing the op log.
    pub fn seed(&self, resource: &ResourceRef, body: Value) {
        self.resources.write().insert(key(resource), body);
    }

    pub fn get(&self, resource: &ResourceRef) -> Option<Value> {
        self.resources.read().get(&key(resource)).cloned()
    }

    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ops(&self) -> Vec<ClusterOp> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    fn check(&self, resource: &ResourceRef) -> Result<(), ClusterError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ClusterError::Transport("cluster unavailable".into()));
        }
        if self.failing_kinds.read().contains(&resource.kind) {
            return Err(ClusterError::Api {
                status: 500,
                message: format!("injected failure for {}", resource),
            });
        }
        Ok(())
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn key(resource: &ResourceRef) -> (String, Option<String>, String) {
    (
        resource.kind.clone(),
        resource.namespace.clone(),
        resource.name.clone(),
    )
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn read(&self, resource: &ResourceRef) -> Result<Value, ClusterError> {
        self.check(resource)?;
        self.get(resource)
            .ok_or_else(|| ClusterError::NotFound(resource.to_string()))
    }

    async fn create(&self, resource: &ResourceRef, body: &Value) -> Result<(), ClusterError> {
        self.check(resource)?;
        let mut resources = self.resources.write();
        let k = key(resource);
        if resources.contains_key(&k) {
            return Err(ClusterError::Api {
                status: 409,
                message: format!("{} already exists", resource),
            });
        }
        resources.insert(k, body.clone());
        drop(resources);
        self.ops.lock().push(ClusterOp::Create(resource.clone()));
        Ok(())
    }

    async fn patch(&self, resource: &ResourceRef, body: &Value) -> Result<(), ClusterError> {
        self.check(resource)?;
        let mut resources = self.resources.write();
        let live = resources
            .get_mut(&key(resource))
            .ok_or_else(|| ClusterError::NotFound(resource.to_string()))?;
        conductor_core::deep_merge(live, body);
        drop(resources);
        self.ops.lock().push(ClusterOp::Patch(resource.clone()));
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ClusterError> {
        self.check(resource)?;
        self.resources
            .write()
            .remove(&key(resource))
            .ok_or_else(|| ClusterError::NotFound(resource.to_string()))?;
        self.ops.lock().push(ClusterOp::Delete(resource.clone()));
        Ok(())
    }
}
