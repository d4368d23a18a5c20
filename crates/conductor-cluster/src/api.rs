//! The cluster control API seam.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Kinds addressed without a namespace.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Cluster API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Cluster transport error: {0}")]
    Transport(String),

    #[error("Unsupported resource: {0}")]
    Unsupported(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Address of a cluster resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: Option<&str>,
    ) -> Self {
        let kind = kind.into();
        let namespace = if is_cluster_scoped(&kind) {
            None
        } else {
            namespace.map(str::to_string)
        };
        Self {
            api_version: api_version.into(),
            kind,
            name: name.into(),
            namespace,
        }
    }

    /// Address a manifest resource, defaulting its namespace to `namespace`.
    pub fn for_resource(kind: &str, name: &str, resource: &Value, namespace: &str) -> Self {
        let api_version = resource
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or("v1");
        let ns = resource
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or(namespace);
        Self::new(api_version, kind, name, Some(ns))
    }

    pub fn namespace_ref(namespace: &str) -> Self {
        Self::new("v1", "Namespace", namespace, None)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// CRUD over cluster resources keyed by (kind, name, namespace).
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Whether the API answers at all.
    async fn is_available(&self) -> bool;

    /// Read a live resource. Absence is reported as [`ClusterError::NotFound`].
    async fn read(&self, resource: &ResourceRef) -> Result<Value, ClusterError>;

    async fn create(&self, resource: &ResourceRef, body: &Value) -> Result<(), ClusterError>;

    async fn patch(&self, resource: &ResourceRef, body: &Value) -> Result<(), ClusterError>;

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ClusterError>;
}
