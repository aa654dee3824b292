//! # Blueprint Registry
//!
//! The immutable-versioned catalog of (model, script, config) templates.
//!
//! A blueprint never mutates in place from a reader's point of view: every
//! modification bumps the version, and anything holding the old version
//! (deferred script events, in-flight builds) can tell it is stale.

use std::collections::HashMap;

use atrium_shared::{Blueprint, Value};

/// Catalog of blueprints by id.
#[derive(Default)]
pub struct BlueprintRegistry {
    entries: HashMap<String, Blueprint>,
}

impl BlueprintRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered blueprints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no blueprints are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a blueprint.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Blueprint> {
        self.entries.get(id)
    }

    /// Registers a new blueprint. Returns false (and changes nothing) if
    /// the id is already taken.
    pub fn add(&mut self, blueprint: Blueprint) -> bool {
        if self.entries.contains_key(&blueprint.id) {
            return false;
        }
        self.entries.insert(blueprint.id.clone(), blueprint);
        true
    }

    /// Applies a partial modification and bumps the version.
    ///
    /// Fields present in `changes` replace the current ones (`model: null`
    /// clears the model). Returns the new version, or None for an unknown
    /// id.
    pub fn modify(&mut self, id: &str, changes: &Value) -> Option<u32> {
        let entry = self.entries.get_mut(id)?;
        if let Some(model) = changes.get("model") {
            entry.model = model.as_str().map(str::to_owned);
        }
        if let Some(script) = changes.get("script") {
            entry.script = script.as_str().map(str::to_owned);
        }
        if let Some(config) = changes.get("config") {
            entry.config = config.clone();
        }
        if let Some(preload) = changes.get("preload").and_then(Value::as_bool) {
            entry.preload = preload;
        }
        entry.version += 1;
        Some(entry.version)
    }

    /// Inserts a blueprint received from a peer, replacing only if the
    /// incoming version is newer. Returns true when the registry changed.
    pub fn upsert_replicated(&mut self, blueprint: Blueprint) -> bool {
        match self.entries.get(&blueprint.id) {
            Some(existing) if existing.version >= blueprint.version => false,
            _ => {
                self.entries.insert(blueprint.id.clone(), blueprint);
                true
            }
        }
    }

    /// Removes a blueprint (upload rollback). Returns the removed entry.
    pub fn remove(&mut self, id: &str) -> Option<Blueprint> {
        self.entries.remove(id)
    }

    /// Snapshot of the whole catalog, sorted by id for a stable wire order.
    #[must_use]
    pub fn serialize(&self) -> Vec<Blueprint> {
        let mut out: Vec<Blueprint> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Replaces the catalog from a snapshot.
    pub fn deserialize(&mut self, blueprints: Vec<Blueprint>) {
        self.entries.clear();
        for blueprint in blueprints {
            self.entries.insert(blueprint.id.clone(), blueprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_shared::value::obj;

    fn bp(id: &str, version: u32) -> Blueprint {
        Blueprint {
            id: id.to_owned(),
            version,
            model: Some("asset://aa.glb".to_owned()),
            script: None,
            config: Value::object(),
            preload: false,
        }
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let mut reg = BlueprintRegistry::new();
        assert!(reg.add(bp("x", 0)));
        assert!(!reg.add(bp("x", 5)));
        assert_eq!(reg.get("x").unwrap().version, 0);
    }

    #[test]
    fn test_modify_bumps_version() {
        let mut reg = BlueprintRegistry::new();
        reg.add(bp("x", 0));
        let v = reg
            .modify("x", &obj(&[("script", Value::Str("asset://s.js".to_owned()))]))
            .unwrap();
        assert_eq!(v, 1);
        let entry = reg.get("x").unwrap();
        assert_eq!(entry.script.as_deref(), Some("asset://s.js"));
        // Unmentioned fields survive.
        assert_eq!(entry.model.as_deref(), Some("asset://aa.glb"));

        // Null clears.
        reg.modify("x", &obj(&[("model", Value::Null)])).unwrap();
        assert!(reg.get("x").unwrap().model.is_none());
        assert_eq!(reg.get("x").unwrap().version, 2);
    }

    #[test]
    fn test_replicated_upsert_respects_versions() {
        let mut reg = BlueprintRegistry::new();
        reg.add(bp("x", 3));
        assert!(!reg.upsert_replicated(bp("x", 2)));
        assert!(!reg.upsert_replicated(bp("x", 3)));
        assert!(reg.upsert_replicated(bp("x", 4)));
        assert_eq!(reg.get("x").unwrap().version, 4);
    }

    #[test]
    fn test_serialize_is_sorted() {
        let mut reg = BlueprintRegistry::new();
        reg.add(bp("zz", 0));
        reg.add(bp("aa", 0));
        let snapshot = reg.serialize();
        assert_eq!(snapshot[0].id, "aa");
        assert_eq!(snapshot[1].id, "zz");
    }
}
