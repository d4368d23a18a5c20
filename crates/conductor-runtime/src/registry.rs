//! Priority-ordered registries for services and contexts.
//!
//! Entries are never removed. Several entries may share a name; lookups
//! return the one with the highest priority, and among equal priorities
//! the most recently registered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use conductor_core::{Error, Result};

use crate::types::{Registration, ServiceDescriptor};

/// Something that can be ranked by (priority, recency) under a name.
pub trait Ranked {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn seq(&self) -> u64;
}

pub struct Registry<T> {
    entries: RwLock<Vec<Arc<T>>>,
    next_seq: AtomicU64,
}

impl<T: Ranked> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Insert an entry built from the next sequence number.
    pub fn insert_with(&self, make: impl FnOnce(u64) -> T) -> Arc<T> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(make(seq));
        let mut entries = self.entries.write();
        entries.push(entry.clone());
        entries.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| b.seq().cmp(&a.seq()))
        });
        entry
    }

    /// The winning entry for `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.name() == name)
            .cloned()
    }

    /// Every entry for `name`, best first.
    pub fn candidates(&self, name: &str) -> Vec<Arc<T>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    /// Distinct registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().iter().any(|e| e.name() == name)
    }
}

impl<T: Ranked> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub type ServiceRegistry = Registry<ServiceDescriptor>;

impl Registry<ServiceDescriptor> {
    pub fn register(&self, registration: Registration) -> Arc<ServiceDescriptor> {
        let descriptor = self.insert_with(|seq| registration.into_descriptor(seq));
        debug!(
            "Registered service {} (priority {}, seq {})",
            descriptor.name, descriptor.priority, descriptor.seq
        );
        descriptor
    }
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// Builds a named context value from service configuration.
pub trait ContextBuilder: Send + Sync {
    fn build(&self, config: &Value) -> Result<Value>;
}

impl<F> ContextBuilder for F
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    fn build(&self, config: &Value) -> Result<Value> {
        self(config)
    }
}

pub struct ContextDescriptor {
    pub name: String,
    pub builder: Arc<dyn ContextBuilder>,
    pub priority: i32,
    pub seq: u64,
}

impl Ranked for ContextDescriptor {
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

#[derive(Default)]
pub struct ContextRegistry {
    inner: Registry<ContextDescriptor>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, builder: Arc<dyn ContextBuilder>, priority: i32) {
        self.inner.insert_with(|seq| ContextDescriptor {
            name: name.to_string(),
            builder,
            priority,
            seq,
        });
        debug!("Registered context {} (priority {})", name, priority);
    }

    /// Build `name` with the winning builder.
    pub fn build(&self, name: &str, config: &Value) -> Result<Value> {
        let descriptor = self
            .inner
            .lookup(name)
            .ok_or_else(|| Error::NotFound(format!("context {}", name)))?;
        descriptor.builder.build(config)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Entry {
        name: &'static str,
        priority: i32,
        seq: u64,
    }

    impl Ranked for Entry {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn seq(&self) -> u64 {
            self.seq
        }
    }

    fn add(registry: &Registry<Entry>, name: &'static str, priority: i32) -> u64 {
        registry
            .insert_with(|seq| Entry {
                name,
                priority,
                seq,
            })
            .seq
    }

    #[test]
    fn test_highest_priority_wins() {
        let registry = Registry::new();
        let low = add(&registry, "db", 1);
        let high = add(&registry, "db", 5);
        add(&registry, "db", 3);
        assert_ne!(low, high);
        assert_eq!(registry.lookup("db").unwrap().seq, high);
    }

    #[test]
    fn test_newest_wins_on_tie() {
        let registry = Registry::new();
        add(&registry, "db", 2);
        let newer = add(&registry, "db", 2);
        assert_eq!(registry.lookup("db").unwrap().seq, newer);
        assert_eq!(registry.candidates("db").len(), 2);
    }

    #[test]
    fn test_names_and_missing() {
        let registry = Registry::new();
        add(&registry, "b", 0);
        add(&registry, "a", 0);
        add(&registry, "a", 1);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.lookup("c").is_none());
        assert!(!registry.contains("c"));
    }

    #[test]
    fn test_context_override() {
        let contexts = ContextRegistry::new();
        contexts.register(
            "llm",
            Arc::new(|_: &Value| -> Result<Value> { Ok(json!("base")) }),
            0,
        );
        contexts.register(
            "llm",
            Arc::new(|cfg: &Value| -> Result<Value> { Ok(json!({"model": cfg["model"].clone()})) }),
            10,
        );
        contexts.register(
            "llm",
            Arc::new(|_: &Value| -> Result<Value> { Ok(json!("late")) }),
            0,
        );

        let ctx = contexts.build("llm", &json!({"model": "small"})).unwrap();
        assert_eq!(ctx, json!({"model": "small"}));
        assert!(matches!(
            contexts.build("nope", &Value::Null),
            Err(Error::NotFound(_))
        ));
    }
}
