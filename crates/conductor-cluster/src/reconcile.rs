//! Drive a resolved manifest into the cluster.
//!
//! One pass creates absent resources, patches resources whose version label
//! differs from the desired digest, and deletes resources that were applied
//! previously but are no longer declared. Failures on one resource are
//! logged and recorded; the pass always continues with the next one.

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use conductor_manifest::ResolvedManifest;

use crate::api::{is_cluster_scoped, ClusterApi, ResourceRef};

/// Label carrying the digest of the desired resource body.
pub const VERSION_LABEL: &str = "conductor.io/version";

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub patched: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
    /// Deletions refused because the kind is unsafe and not unlocked.
    pub skipped_unsafe: Vec<String>,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Short sha256 digest of a resource body.
pub fn resource_digest(resource: &Value) -> String {
    let bytes = serde_json::to_vec(resource).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..8])
}

pub struct Reconciler<'a> {
    api: &'a dyn ClusterApi,
    unsafe_kinds: &'a [String],
    allow_unsafe: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(api: &'a dyn ClusterApi, unsafe_kinds: &'a [String]) -> Self {
        Self {
            api,
            unsafe_kinds,
            allow_unsafe: false,
        }
    }

    /// Permit deletion of unsafe kinds for this pass.
    pub fn allow_unsafe(mut self, allow: bool) -> Self {
        self.allow_unsafe = allow;
        self
    }

    /// Inject `namespace` into namespaced resources and stamp every resource
    /// with its [`VERSION_LABEL`].
    pub fn prepare(manifest: &mut ResolvedManifest, namespace: &str) {
        for (kind, resource) in manifest.resources_mut() {
            if !is_cluster_scoped(kind) {
                if let Some(meta) = resource.get_mut("metadata").and_then(Value::as_object_mut)
                {
                    meta.insert("namespace".into(), json!(namespace));
                }
            }
            if let Some(labels) = resource
                .pointer_mut("/metadata/labels")
                .and_then(Value::as_object_mut)
            {
                labels.remove(VERSION_LABEL);
            }
            let digest = resource_digest(resource);
            if let Some(meta) = resource.get_mut("metadata").and_then(Value::as_object_mut) {
                let labels = meta.entry("labels").or_insert_with(|| json!({}));
                if let Some(labels) = labels.as_object_mut() {
                    labels.insert(VERSION_LABEL.into(), json!(digest));
                }
            }
        }
    }

    /// Apply `desired`, deleting whatever `previous` held that `desired` dropped.
    pub async fn apply(
        &self,
        namespace: &str,
        desired: &ResolvedManifest,
        previous: Option<&ResolvedManifest>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let needs_namespace = desired.iter().any(|(kind, _, _)| !is_cluster_scoped(kind))
            && !desired.contains("Namespace", namespace);
        if needs_namespace {
            self.ensure_namespace(namespace, &mut report).await;
        }

        for (kind, name, resource) in desired.iter() {
            let target = ResourceRef::for_resource(kind, name, resource, namespace);
            self.apply_one(&target, resource, &mut report).await;
        }

        if let Some(previous) = previous {
            for key in desired.removed_since(previous) {
                let Some(resource) = previous.get(&key.kind, &key.name) else {
                    continue;
                };
                let target = ResourceRef::for_resource(&key.kind, &key.name, resource, namespace);
                self.delete_one(&target, &mut report).await;
            }
        }

        info!(
            "Reconciled namespace {}: {} created, {} patched, {} deleted, {} unchanged, {} skipped, {} errors",
            namespace,
            report.created.len(),
            report.patched.len(),
            report.deleted.len(),
            report.unchanged,
            report.skipped_unsafe.len(),
            report.errors.len()
        );
        report
    }

    async fn ensure_namespace(&self, namespace: &str, report: &mut ReconcileReport) {
        let target = ResourceRef::namespace_ref(namespace);
        match self.api.read(&target).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                let body = json!({
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": {"name": namespace},
                });
                match self.api.create(&target, &body).await {
                    Ok(()) => {
                        info!("Created namespace {}", namespace);
                        report.created.push(target.to_string());
                    }
                    Err(e) => {
                        error!("Failed to create namespace {}: {}", namespace, e);
                        report.errors.push(format!("{}: {}", target, e));
                    }
                }
            }
            Err(e) => {
                error!("Failed to read namespace {}: {}", namespace, e);
                report.errors.push(format!("{}: {}", target, e));
            }
        }
    }

    async fn apply_one(&self, target: &ResourceRef, desired: &Value, report: &mut ReconcileReport) {
        match self.api.read(target).await {
            Ok(live) => {
                let live_version = live.pointer(&label_pointer()).and_then(Value::as_str);
                let desired_version = desired.pointer(&label_pointer()).and_then(Value::as_str);
                if live_version.is_some() && live_version == desired_version {
                    report.unchanged += 1;
                    return;
                }
                match self.api.patch(target, desired).await {
                    Ok(()) => {
                        info!("Patched {}", target);
                        report.patched.push(target.to_string());
                    }
                    Err(e) => {
                        error!("Failed to patch {}: {}", target, e);
                        report.errors.push(format!("{}: {}", target, e));
                    }
                }
            }
            Err(e) if e.is_not_found() => match self.api.create(target, desired).await {
                Ok(()) => {
                    info!("Created {}", target);
                    report.created.push(target.to_string());
                }
                Err(e) => {
                    error!("Failed to create {}: {}", target, e);
                    report.errors.push(format!("{}: {}", target, e));
                }
            },
            Err(e) => {
                error!("Failed to read {}: {}", target, e);
                report.errors.push(format!("{}: {}", target, e));
            }
        }
    }

    async fn delete_one(&self, target: &ResourceRef, report: &mut ReconcileReport) {
        if !self.allow_unsafe && self.unsafe_kinds.iter().any(|k| *k == target.kind) {
            warn!(
                "Skipping deletion of {}: {} is an unsafe kind and no passphrase was supplied",
                target, target.kind
            );
            report.skipped_unsafe.push(target.to_string());
            return;
        }
        match self.api.delete(target).await {
            Ok(()) => {
                info!("Deleted {}", target);
                report.deleted.push(target.to_string());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!("Failed to delete {}: {}", target, e);
                report.errors.push(format!("{}: {}", target, e));
            }
        }
    }
}

fn label_pointer() -> String {
    format!("/metadata/labels/{}", VERSION_LABEL.replace('~', "~0").replace('/', "~1"))
}
