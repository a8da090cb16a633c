// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Default deep-merge of two partial representations of the same entity.
//!
//! Rules:
//! - object + object: union of keys, shared keys merged recursively;
//! - a [`StoreValue::Reference`] on either side is atomic, incoming wins;
//! - lists are replaced wholesale (per-field merge functions handle
//!   element-wise merging);
//! - scalars and shared leaves: incoming wins.
//!
//! [`Overrides`] exempts individual fields from the recursion so a custom
//! merge function's result is stored exactly as returned.
//!
//! Neither input is mutated.

use std::collections::BTreeMap;

use crate::value::{StoreObject, StoreValue};

/// Merge `incoming` over `existing`.
pub fn merge_values(existing: &StoreValue, incoming: &StoreValue) -> StoreValue {
    match (existing, incoming) {
        (StoreValue::Object(a), StoreValue::Object(b)) => StoreValue::Object(merge_objects(a, b)),
        _ => incoming.clone(),
    }
}

/// Merge two records key by key.
pub fn merge_objects(existing: &StoreObject, incoming: &StoreObject) -> StoreObject {
    let mut merged = existing.clone();
    for (key, value) in incoming {
        let next = match merged.get(key) {
            Some(current) => merge_values(current, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Owned variant of [`merge_objects`], except that fields named in
/// `overrides` take the incoming value as is. Used for the output of custom
/// merge functions, which already saw the stored value.
pub fn merge_objects_overriding(
    existing: StoreObject,
    incoming: StoreObject,
    overrides: &Overrides,
) -> StoreObject {
    merge_owned(existing, incoming, Some(overrides))
}

fn merge_owned(
    mut existing: StoreObject,
    incoming: StoreObject,
    overrides: Option<&Overrides>,
) -> StoreObject {
    for (key, value) in incoming {
        let rule = overrides.and_then(|o| o.fields.get(&key));
        let next = match (rule, existing.remove(&key), value) {
            (Some(Override::Replace), _, value) => value,
            (rule, Some(StoreValue::Object(current)), StoreValue::Object(inner)) => {
                let nested = match rule {
                    Some(Override::Nested(n)) => Some(n),
                    _ => None,
                };
                StoreValue::Object(merge_owned(current, inner, nested))
            }
            (_, _, value) => value,
        };
        existing.insert(key, next);
    }
    existing
}

/// Field paths whose incoming value replaces the stored one outright.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Overrides {
    fields: BTreeMap<String, Override>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Override {
    Replace,
    Nested(Overrides),
}

impl Overrides {
    /// No overrides: plain deep merge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when nothing is overridden.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Replace `key` wholesale.
    pub fn replace(&mut self, key: impl Into<String>) {
        self.fields.insert(key.into(), Override::Replace);
    }

    /// Apply `inner` to the object stored under `key`. Empty sets are dropped.
    pub fn nest(&mut self, key: impl Into<String>, inner: Self) {
        if !inner.is_empty() {
            self.fields.insert(key.into(), Override::Nested(inner));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Reference;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> StoreObject {
        match StoreValue::from_json(&v) {
            StoreValue::Object(map) => map,
            _ => StoreObject::new(),
        }
    }

    #[test]
    fn merging_empty_is_identity() {
        let existing = obj(json!({"id": "1", "meta": {"a": 1}}));
        assert_eq!(merge_objects(&existing, &StoreObject::new()), existing);
    }

    #[test]
    fn nested_objects_union() {
        let merged = merge_objects(
            &obj(json!({"meta": {"a": 1, "b": 2}})),
            &obj(json!({"meta": {"b": 3, "c": 4}})),
        );
        assert_eq!(merged, obj(json!({"meta": {"a": 1, "b": 3, "c": 4}})));
    }

    #[test]
    fn lists_replace_wholesale() {
        let merged = merge_objects(&obj(json!({"tags": [1, 2, 3]})), &obj(json!({"tags": [9]})));
        assert_eq!(merged, obj(json!({"tags": [9]})));
    }

    #[test]
    fn reference_replaces_object_without_recursing() {
        let mut existing = StoreObject::new();
        existing.insert("owner".into(), StoreValue::from_json(&json!({"name": "x"})));
        let mut incoming = StoreObject::new();
        incoming.insert("owner".into(), Reference::new("User:1").into());
        let merged = merge_objects(&existing, &incoming);
        assert_eq!(merged["owner"], StoreValue::Reference(Reference::new("User:1")));
    }

    #[test]
    fn object_replaces_reference() {
        let mut existing = StoreObject::new();
        existing.insert("owner".into(), Reference::new("User:1").into());
        let incoming = obj(json!({"owner": {"name": "inline"}}));
        let merged = merge_objects(&existing, &incoming);
        assert_eq!(merged["owner"], StoreValue::from_json(&json!({"name": "inline"})));
    }

    #[test]
    fn inputs_are_untouched_and_owned_variant_agrees() {
        let existing = obj(json!({"a": {"x": 1}, "b": 2}));
        let incoming = obj(json!({"a": {"y": 2}, "c": 3}));
        let before = (existing.clone(), incoming.clone());
        let borrowed = merge_objects(&existing, &incoming);
        assert_eq!((existing.clone(), incoming.clone()), before);
        assert_eq!(merge_objects_overriding(existing, incoming, &Overrides::new()), borrowed);
    }

    #[test]
    fn overridden_fields_replace_and_nested_overrides_reach_inline_objects() {
        let existing = obj(json!({"meta": {"a": 1, "b": 2}, "info": {"x": {"k": 1}, "y": 1}}));
        let incoming = obj(json!({"meta": {"c": 3}, "info": {"x": {"j": 2}}}));
        let mut inner = Overrides::new();
        inner.replace("x");
        let mut overrides = Overrides::new();
        overrides.replace("meta");
        overrides.nest("info", inner);
        overrides.nest("unused", Overrides::new());

        let merged = merge_objects_overriding(existing.clone(), incoming.clone(), &overrides);
        assert_eq!(
            merged,
            obj(json!({"meta": {"c": 3}, "info": {"x": {"j": 2}, "y": 1}}))
        );
        assert_eq!(
            merge_objects_overriding(existing.clone(), incoming.clone(), &Overrides::new()),
            merge_objects(&existing, &incoming)
        );
    }
}
