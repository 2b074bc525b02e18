//! Global registry of exported variables.
//!
//! Suites publish their `exports` here when a run completes; dependent
//! runs take a snapshot at start. Publishing is serialized and
//! all-or-nothing per suite: readers never observe a half-published
//! export set.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::suite::Dependency;

#[derive(Debug, Default)]
pub struct ExportRegistry {
    entries: RwLock<HashMap<String, Map<String, Value>>>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a suite's published exports in one step.
    pub fn publish(&self, namespace: &str, exports: Map<String, Value>) {
        let mut entries = self.entries.write().expect("export registry poisoned");
        entries.insert(namespace.to_string(), exports);
    }

    /// Imported-scope seed for a run: the published values of each
    /// declared dependency, nested under its namespace. Values are a
    /// snapshot; later publishes do not bleed into a running suite.
    pub fn snapshot_for(&self, depends: &[Dependency]) -> Map<String, Value> {
        let entries = self.entries.read().expect("export registry poisoned");
        let mut imported = Map::new();
        for dependency in depends {
            let Some(namespace) = dependency.namespace() else {
                continue;
            };
            if let Some(exports) = entries.get(namespace) {
                imported.insert(namespace.to_string(), Value::Object(exports.clone()));
            }
        }
        imported
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Value> {
        let entries = self.entries.read().expect("export registry poisoned");
        entries.get(namespace).and_then(|m| m.get(name)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dependency(node_id: &str) -> Dependency {
        serde_yaml::from_str(&format!("node_id: {node_id}")).unwrap()
    }

    fn exports(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn snapshot_only_includes_declared_dependencies() {
        let registry = ExportRegistry::new();
        registry.publish("auth", exports(&[("token", json!("T"))]));
        registry.publish("billing", exports(&[("plan", json!("pro"))]));

        let snapshot = registry.snapshot_for(&[dependency("auth")]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["auth"]["token"], json!("T"));
    }

    #[test]
    fn publish_replaces_wholesale() {
        let registry = ExportRegistry::new();
        registry.publish("auth", exports(&[("token", json!("old")), ("ttl", json!(60))]));
        registry.publish("auth", exports(&[("token", json!("new"))]));

        assert_eq!(registry.get("auth", "token"), Some(json!("new")));
        assert_eq!(registry.get("auth", "ttl"), None);
    }

    #[test]
    fn snapshot_is_isolated_from_later_publishes() {
        let registry = ExportRegistry::new();
        registry.publish("auth", exports(&[("token", json!("T1"))]));
        let snapshot = registry.snapshot_for(&[dependency("auth")]);
        registry.publish("auth", exports(&[("token", json!("T2"))]));
        assert_eq!(snapshot["auth"]["token"], json!("T1"));
    }

    #[test]
    fn unpublished_dependency_is_absent() {
        let registry = ExportRegistry::new();
        let snapshot = registry.snapshot_for(&[dependency("never-ran")]);
        assert!(snapshot.is_empty());
    }
}
