//! Persistent orchestrator state: service config overrides, manifest
//! history and the values that took effect on the last apply.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;

use conductor_core::{Error, Result};
use conductor_manifest::ResolvedManifest;

pub const SCOPE_CONFIG: &str = "config";
pub const SCOPE_HISTORY: &str = "history";
pub const SCOPE_RESOLVED: &str = "resolved";

/// JSON key/value storage partitioned by scope.
pub trait StateStore: Send + Sync {
    /// Fails when the backing datastore cannot be reached.
    fn ping(&self) -> Result<()>;

    fn get(&self, scope: &str, key: &str) -> Result<Option<Value>>;

    fn put(&self, scope: &str, key: &str, value: &Value) -> Result<()>;

    /// Persisted config override for a config key.
    fn get_config(&self, key: &str) -> Result<Option<Value>> {
        self.get(SCOPE_CONFIG, key)
    }

    fn put_config(&self, key: &str, config: &Value) -> Result<()> {
        self.put(SCOPE_CONFIG, key, config)
    }

    /// Last applied manifest for a manifest key.
    fn get_history(&self, key: &str) -> Result<Option<ResolvedManifest>> {
        match self.get(SCOPE_HISTORY, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn put_history(&self, key: &str, manifest: &ResolvedManifest) -> Result<()> {
        self.put(SCOPE_HISTORY, key, &serde_json::to_value(manifest)?)
    }

    fn get_resolved(&self, key: &str) -> Result<Option<BTreeMap<String, Value>>> {
        match self.get(SCOPE_RESOLVED, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn put_resolved(&self, key: &str, values: &BTreeMap<String, Value>) -> Result<()> {
        self.put(SCOPE_RESOLVED, key, &serde_json::to_value(values)?)
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv (
    scope      TEXT NOT NULL,
    key        TEXT NOT NULL,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (scope, key)
);
";

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStateStore {
    /// Open or create `<dir>/conductor.db`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("conductor.db");

        let conn = Connection::open(&db_path).map_err(|e| Error::Store(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| Error::Store(e.to_string()))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| Error::Store(format!("Schema init failed: {}", e)))?;

        info!("State store opened at {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

impl StateStore for SqliteStateStore {
    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| Error::Unreachable(e.to_string()))?;
        Ok(())
    }

    fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let text: Option<String> = conn
            .prepare_cached("SELECT value FROM kv WHERE scope = ?1 AND key = ?2")
            .map_err(|e| Error::Store(e.to_string()))?
            .query_row(params![scope, key], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Store(e.to_string()))?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn put(&self, scope: &str, key: &str, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO kv (scope, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .map_err(|e| Error::Store(e.to_string()))?
        .execute(params![scope, key, text, now])
        .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Volatile store. Can be switched unreachable to exercise bootstrap paths.
pub struct MemoryStateStore {
    entries: RwLock<HashMap<(String, String), Value>>,
    reachable: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unreachable("memory store offline".into()))
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    fn ping(&self) -> Result<()> {
        self.check()
    }

    fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        self.check()?;
        Ok(self
            .entries
            .read()
            .get(&(scope.to_string(), key.to_string()))
            .cloned())
    }

    fn put(&self, scope: &str, key: &str, value: &Value) -> Result<()> {
        self.check()?;
        self.entries
            .write()
            .insert((scope.to_string(), key.to_string()), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_manifest() -> ResolvedManifest {
        let mut manifest = ResolvedManifest::new();
        manifest
            .insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg"}}))
            .unwrap();
        manifest
    }

    #[test]
    fn test_sqlite_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStateStore::open(dir.path()).unwrap();
        store.ping().unwrap();

        assert!(store.get_config("db").unwrap().is_none());
        store.put_config("db", &json!({"replicas": 2})).unwrap();
        store.put_config("db", &json!({"replicas": 3})).unwrap();
        assert_eq!(store.get_config("db").unwrap(), Some(json!({"replicas": 3})));

        let manifest = sample_manifest();
        store.put_history("db", &manifest).unwrap();
        assert_eq!(store.get_history("db").unwrap(), Some(manifest));
    }

    #[test]
    fn test_sqlite_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SqliteStateStore::open(dir.path()).unwrap();
            let mut values = BTreeMap::new();
            values.insert("image".to_string(), json!("db:1"));
            store.put_resolved("db", &values).unwrap();
        }
        let store = SqliteStateStore::open(dir.path()).unwrap();
        let values = store.get_resolved("db").unwrap().unwrap();
        assert_eq!(values["image"], json!("db:1"));
    }

    #[test]
    fn test_scopes_are_separate() {
        let store = MemoryStateStore::new();
        store.put(SCOPE_CONFIG, "db", &json!(1)).unwrap();
        assert!(store.get(SCOPE_RESOLVED, "db").unwrap().is_none());
    }

    #[test]
    fn test_memory_unreachable() {
        let store = MemoryStateStore::new();
        store.put_config("db", &json!({})).unwrap();
        store.set_reachable(false);
        assert!(matches!(store.ping(), Err(Error::Unreachable(_))));
        assert!(store.get_config("db").is_err());
        store.set_reachable(true);
        assert!(store.get_config("db").unwrap().is_some());
    }
}
