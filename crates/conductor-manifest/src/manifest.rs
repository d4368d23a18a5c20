//! Resolved manifest model: kind → name → resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use conductor_core::{Error, Result};

/// A fully rendered manifest, indexed by resource kind and name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedManifest {
    kinds: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Identity of a resource inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub kind: String,
    pub name: String,
}

impl ResolvedManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse rendered template files (multi-document YAML) into a manifest.
    pub fn from_rendered(files: &BTreeMap<String, String>) -> Result<Self> {
        let mut manifest = Self::new();
        for (file, text) in files {
            for doc in serde_yaml::Deserializer::from_str(text) {
                let yaml = serde_yaml::Value::deserialize(doc)
                    .map_err(|e| Error::Manifest(format!("{}: {}", file, e)))?;
                if yaml.is_null() {
                    continue;
                }
                let resource = serde_json::to_value(yaml)
                    .map_err(|e| Error::Manifest(format!("{}: {}", file, e)))?;
                manifest
                    .insert(resource)
                    .map_err(|e| Error::Manifest(format!("{}: {}", file, e)))?;
            }
        }
        Ok(manifest)
    }

    /// Add a resource; it must carry `kind` and `metadata.name`.
    pub fn insert(&mut self, resource: Value) -> Result<ResourceKey> {
        let kind = resource
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Manifest("resource without kind".into()))?
            .to_string();
        let name = resource
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Manifest(format!("{} without metadata.name", kind)))?
            .to_string();

        let by_name = self.kinds.entry(kind.clone()).or_default();
        if by_name.insert(name.clone(), resource).is_some() {
            warn!("Duplicate {} {} in manifest; keeping the last", kind, name);
        }
        Ok(ResourceKey { kind, name })
    }

    pub fn get(&self, kind: &str, name: &str) -> Option<&Value> {
        self.kinds.get(kind).and_then(|m| m.get(name))
    }

    pub fn contains(&self, kind: &str, name: &str) -> bool {
        self.get(kind, name).is_some()
    }

    /// Iterate resources in (kind, name) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.kinds.iter().flat_map(|(kind, by_name)| {
            by_name
                .iter()
                .map(move |(name, res)| (kind.as_str(), name.as_str(), res))
        })
    }

    pub fn len(&self) -> usize {
        self.kinds.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resources present in `previous` that this manifest no longer declares.
    pub fn removed_since(&self, previous: &ResolvedManifest) -> Vec<ResourceKey> {
        previous
            .iter()
            .filter(|(kind, name, _)| !self.contains(kind, name))
            .map(|(kind, name, _)| ResourceKey {
                kind: kind.to_string(),
                name: name.to_string(),
            })
            .collect()
    }

    /// Mutable access to every resource, for label or namespace injection.
    pub fn resources_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.kinds.iter_mut().flat_map(|(kind, by_name)| {
            by_name.values_mut().map(move |res| (kind.as_str(), res))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_multi_document() {
        let manifest = ResolvedManifest::from_rendered(&files(&[(
            "all.yaml",
            "kind: Deployment\nmetadata:\n  name: web\n---\nkind: Service\nmetadata:\n  name: web\n---\n",
        )]))
        .unwrap();
        assert_eq!(manifest.len(), 2);
        assert!(manifest.contains("Deployment", "web"));
        assert!(manifest.contains("Service", "web"));
    }

    #[test]
    fn test_missing_name_is_error() {
        let err = ResolvedManifest::from_rendered(&files(&[("x.yaml", "kind: Service\n")]));
        assert!(matches!(err, Err(Error::Manifest(_))));
    }

    #[test]
    fn test_removed_since() {
        let mut old = ResolvedManifest::new();
        old.insert(json!({"kind": "Service", "metadata": {"name": "a"}})).unwrap();
        old.insert(json!({"kind": "Service", "metadata": {"name": "b"}})).unwrap();

        let mut new = ResolvedManifest::new();
        new.insert(json!({"kind": "Service", "metadata": {"name": "a"}})).unwrap();

        let removed = new.removed_since(&old);
        assert_eq!(
            removed,
            vec![ResourceKey {
                kind: "Service".into(),
                name: "b".into()
            }]
        );
        assert!(old.removed_since(&new).is_empty());
    }

    #[test]
    fn test_serde_shape() {
        let mut m = ResolvedManifest::new();
        m.insert(json!({"kind": "ConfigMap", "metadata": {"name": "cfg"}})).unwrap();
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["ConfigMap"]["cfg"]["kind"], json!("ConfigMap"));
        let back: ResolvedManifest = serde_json::from_value(v).unwrap();
        assert_eq!(back, m);
    }
}
