// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Post-merge heuristic that warns when a write replaces an unidentified
//! child object with one that lacks some of its fields.
//!
//! Purely diagnostic: nothing here changes stored data. Warnings are
//! de-duplicated per `(parent type, field name)` for the lifetime of the
//! owning guard.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::selection::field_name_from_store_name;
use crate::store::NormalizedStore;
use crate::value::{StoreObject, StoreValue, TYPENAME_FIELD};

/// One emitted data-loss warning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataLossWarning {
    /// Type of the entity owning the field, when known.
    pub parent_typename: Option<String>,
    /// Schema field name.
    pub field_name: String,
    /// Distinct `__typename`s of the existing and incoming child objects.
    pub child_typenames: Vec<String>,
    /// Truncated JSON of the stored child.
    pub existing: String,
    /// Truncated JSON of the incoming child.
    pub incoming: String,
}

impl fmt::Display for DataLossWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parent = self.parent_typename.as_deref().unwrap_or("unknown");
        write!(
            f,
            "cache data may be lost when replacing the {} field of a {} object; ",
            self.field_name, parent
        )?;
        if self.child_typenames.is_empty() {
            write!(f, "give the child objects identifiers")?;
        } else {
            write!(
                f,
                "give {} objects identifiers",
                self.child_typenames.join(" and ")
            )?;
        }
        write!(
            f,
            " or register a merge function for {parent}.{}; existing: {} incoming: {}",
            self.field_name, self.existing, self.incoming
        )
    }
}

/// De-duplicating data-loss detector.
#[derive(Debug)]
pub struct DataLossGuard {
    warned: Mutex<HashSet<(Option<String>, String)>>,
    snapshot_limit: usize,
}

impl DataLossGuard {
    /// Guard truncating JSON snapshots to `snapshot_limit` characters.
    pub fn new(snapshot_limit: usize) -> Self {
        Self {
            warned: Mutex::new(HashSet::new()),
            snapshot_limit,
        }
    }

    /// Compare the stored and incoming values of `store_field_name` on entity
    /// `entity_id` and warn once if data would be lost.
    ///
    /// Must run before `incoming` is committed.
    pub fn check(
        &self,
        store: &dyn NormalizedStore,
        entity_id: &str,
        store_field_name: &str,
        incoming: &StoreObject,
    ) -> Option<DataLossWarning> {
        let existing_child = store.get(entity_id, store_field_name)?;
        let incoming_child = incoming.get(store_field_name)?;
        if !is_object_shaped(&existing_child) || !is_object_shaped(incoming_child) {
            return None;
        }
        if &existing_child == incoming_child || keys_covered(&existing_child, incoming_child) {
            return None;
        }

        let parent_typename = store
            .get(entity_id, TYPENAME_FIELD)
            .or_else(|| incoming.get(TYPENAME_FIELD).cloned())
            .and_then(|v| v.as_str().map(str::to_owned));
        let field_name = field_name_from_store_name(store_field_name).to_owned();
        let first = self
            .warned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((parent_typename.clone(), field_name.clone()));
        if !first {
            return None;
        }

        let mut child_typenames: Vec<String> = Vec::new();
        for child in [&existing_child, incoming_child] {
            if let Some(t) = child.typename() {
                if !child_typenames.iter().any(|c| c == t) {
                    child_typenames.push(t.to_owned());
                }
            }
        }
        let warning = DataLossWarning {
            parent_typename,
            field_name,
            child_typenames,
            existing: truncate(&existing_child.to_json().to_string(), self.snapshot_limit),
            incoming: truncate(&incoming_child.to_json().to_string(), self.snapshot_limit),
        };
        warn!(entity = entity_id, "{warning}");
        Some(warning)
    }

    /// Forget every warning emitted so far.
    pub fn reset(&self) {
        self.warned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of distinct `(parent type, field)` pairs warned about.
    pub fn warned_count(&self) -> usize {
        self.warned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn is_object_shaped(value: &StoreValue) -> bool {
    matches!(value, StoreValue::Object(_) | StoreValue::List(_))
}

fn keys_covered(existing: &StoreValue, incoming: &StoreValue) -> bool {
    match (existing, incoming) {
        (StoreValue::Object(a), StoreValue::Object(b)) => a.keys().all(|k| b.contains_key(k)),
        (StoreValue::List(a), StoreValue::List(b)) => a.len() <= b.len(),
        _ => false,
    }
}

/// First `limit` characters of `text`.
pub(crate) fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> StoreObject {
        StoreValue::from_json(&v).as_object().cloned().unwrap()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.merge(
            "Todo:1",
            obj(json!({"__typename": "Todo", "meta": {"__typename": "Meta", "a": 1, "b": 2}})),
        );
        store
    }

    #[test]
    fn warns_once_when_subfields_would_be_lost() {
        let store = seeded();
        let guard = DataLossGuard::new(1_000);
        let incoming = obj(json!({"meta": {"__typename": "Meta", "a": 1}}));
        let warning = guard.check(&store, "Todo:1", "meta", &incoming).unwrap();
        assert_eq!(warning.parent_typename.as_deref(), Some("Todo"));
        assert_eq!(warning.field_name, "meta");
        assert_eq!(warning.child_typenames, vec!["Meta".to_owned()]);
        assert!(warning.to_string().contains("Todo.meta"));
        assert!(guard.check(&store, "Todo:1", "meta", &incoming).is_none());
        assert_eq!(guard.warned_count(), 1);
    }

    #[test]
    fn reset_allows_warning_again() {
        let store = seeded();
        let guard = DataLossGuard::new(1_000);
        let incoming = obj(json!({"meta": {"c": 3}}));
        assert!(guard.check(&store, "Todo:1", "meta", &incoming).is_some());
        guard.reset();
        assert!(guard.check(&store, "Todo:1", "meta", &incoming).is_some());
    }

    #[test]
    fn superset_equal_scalar_and_reference_do_not_warn() {
        let store = seeded();
        let guard = DataLossGuard::new(1_000);
        let superset = obj(json!({"meta": {"__typename": "Meta", "a": 1, "b": 3, "c": 4}}));
        assert!(guard.check(&store, "Todo:1", "meta", &superset).is_none());
        let scalar = obj(json!({"meta": 5}));
        assert!(guard.check(&store, "Todo:1", "meta", &scalar).is_none());
        let reference = obj(json!({"meta": {"__ref": "Meta:1"}}));
        assert!(guard.check(&store, "Todo:1", "meta", &reference).is_none());
        assert!(guard.check(&store, "Todo:2", "meta", &superset).is_none());
        assert_eq!(guard.warned_count(), 0);
    }

    #[test]
    fn shrinking_list_warns() {
        let store = MemoryStore::new();
        store.merge("Todo:1", obj(json!({"tags": ["a", "b"]})));
        let guard = DataLossGuard::new(4);
        let w = guard.check(&store, "Todo:1", "tags", &obj(json!({"tags": ["a"]}))).unwrap();
        assert_eq!(w.parent_typename, None);
        assert_eq!(w.existing, "[\"a\"");
    }
}
