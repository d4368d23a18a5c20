//! Cluster gateway: CRUD over a cluster control API plus manifest reconciliation.
//!
//! [`ClusterApi`] is the seam to the external cluster. [`MemoryCluster`]
//! keeps resources in process (tests, embedded use); [`HttpCluster`] talks
//! to a Kubernetes-style REST endpoint. [`Reconciler`] drives a resolved
//! manifest into the cluster: create what is missing, patch what is stale,
//! delete what disappeared, never deleting unsafe kinds unless unlocked.

pub mod api;
pub mod http;
pub mod memory;
pub mod reconcile;

pub use api::{is_cluster_scoped, ClusterApi, ClusterError, ResourceRef};
pub use http::HttpCluster;
pub use memory::{ClusterOp, MemoryCluster};
pub use reconcile::{resource_digest, ReconcileReport, Reconciler, VERSION_LABEL};
