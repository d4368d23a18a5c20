//! Configuration and data directory management.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Paths to all Conductor data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// State store directory (`data/state/`).
    pub state: PathBuf,
    /// Manifest template root (`data/manifests/`), one sub-directory per manifest key.
    pub manifests: PathBuf,
    /// Optional config file (`data/conductor.json`).
    pub config_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            state: root.join("state"),
            manifests: root.join("manifests"),
            config_file: root.join("conductor.json"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state)?;
        std::fs::create_dir_all(&self.manifests)?;
        Ok(())
    }
}

/// Connection settings for the cluster control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Top-level Conductor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Namespace the orchestrator itself runs in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Directory holding one sub-directory of templates per manifest key.
    #[serde(default)]
    pub manifest_root: Option<PathBuf>,
    /// Delay between reconciliation passes.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Lower bound applied to `tick_interval_secs`.
    #[serde(default = "default_min_tick_interval")]
    pub min_tick_interval_secs: u64,
    /// Per-call timeout for worker-hosted actions.
    #[serde(default = "default_call_timeout")]
    pub worker_call_timeout_secs: u64,
    /// Resource kinds never deleted by reconciliation without the passphrase.
    #[serde(default = "default_unsafe_kinds")]
    pub unsafe_kinds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsafe_passphrase: Option<String>,
    /// Manifest key applied while the state store is unreachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore_manifest: Option<String>,
    /// Services queued for reconciliation at start.
    #[serde(default)]
    pub preload: Vec<String>,
    /// Static default configuration per config key.
    #[serde(default)]
    pub services: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterSettings>,
    /// Context handed to worker setup hooks.
    #[serde(default)]
    pub worker_context: Value,
    #[serde(skip)]
    pub data_paths: Option<DataPaths>,
}

fn default_namespace() -> String {
    "default".into()
}
fn default_tick_interval() -> u64 {
    10
}
fn default_min_tick_interval() -> u64 {
    1
}
fn default_call_timeout() -> u64 {
    30
}
fn default_unsafe_kinds() -> Vec<String> {
    vec!["PersistentVolumeClaim".into(), "StatefulSet".into()]
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            manifest_root: None,
            tick_interval_secs: default_tick_interval(),
            min_tick_interval_secs: default_min_tick_interval(),
            worker_call_timeout_secs: default_call_timeout(),
            unsafe_kinds: default_unsafe_kinds(),
            unsafe_passphrase: None,
            datastore_manifest: None,
            preload: Vec::new(),
            services: BTreeMap::new(),
            cluster: None,
            worker_context: Value::Null,
            data_paths: None,
        }
    }
}

impl ConductorConfig {
    /// Load `<data_dir>/conductor.json` (or defaults) and apply environment overrides.
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_paths = DataPaths::new(data_dir)?;

        let mut config = match std::fs::read_to_string(&data_paths.config_file) {
            Ok(data) => serde_json::from_str::<ConductorConfig>(&data).map_err(|e| {
                Error::Config(format!("{}: {}", data_paths.config_file.display(), e))
            })?,
            Err(_) => {
                info!(
                    "No config at {}, using defaults",
                    data_paths.config_file.display()
                );
                ConductorConfig::default()
            }
        };

        if config.manifest_root.is_none() {
            config.manifest_root = Some(data_paths.manifests.clone());
        }
        config.data_paths = Some(data_paths);
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ns) = lookup("CONDUCTOR_NAMESPACE") {
            self.namespace = ns;
        }
        if let Some(secs) = lookup("CONDUCTOR_TICK_SECS") {
            match secs.parse() {
                Ok(secs) => self.tick_interval_secs = secs,
                Err(_) => warn!("Ignoring invalid CONDUCTOR_TICK_SECS={}", secs),
            }
        }
        if let Some(secs) = lookup("CONDUCTOR_CALL_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => self.worker_call_timeout_secs = secs,
                Err(_) => warn!("Ignoring invalid CONDUCTOR_CALL_TIMEOUT_SECS={}", secs),
            }
        }
        if let Some(url) = lookup("CONDUCTOR_CLUSTER_URL") {
            let token = lookup("CONDUCTOR_CLUSTER_TOKEN");
            self.cluster = Some(ClusterSettings {
                api_url: url,
                token,
            });
        }
        if let Some(phrase) = lookup("CONDUCTOR_UNSAFE_PASSPHRASE") {
            self.unsafe_passphrase = Some(phrase);
        }
    }

    /// Effective tick interval with the configured floor applied.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs.max(self.min_tick_interval_secs))
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.worker_call_timeout_secs)
    }

    /// Static default configuration for a config key (`null` if absent).
    pub fn service_default(&self, config_key: &str) -> Value {
        self.services.get(config_key).cloned().unwrap_or(Value::Null)
    }

    /// Directory holding the templates of a manifest key.
    pub fn manifest_dir(&self, manifest_key: &str) -> Option<PathBuf> {
        self.manifest_root
            .as_ref()
            .map(|root| root.join(manifest_key))
    }
}
