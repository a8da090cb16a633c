// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Values produced while walking one write, before custom merges run.
//!
//! A field with a registered merge function cannot be resolved while its
//! selection set is still being walked: the merge function needs the fully
//! accumulated incoming value. Such fields are parked as
//! [`Incoming::Pending`] and resolved by [`resolve_fields`] when the enclosing
//! entity is committed.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::merge::{merge_values, Overrides};
use crate::policy::{CachePolicy, MergeContext};
use crate::selection::Variables;
use crate::store::{field_value, NormalizedStore};
use crate::value::{StoreObject, StoreValue};

/// Field map of an object still being assembled.
pub(crate) type IncomingObject = BTreeMap<String, Incoming>;

/// A processed field value.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Incoming {
    /// Final stored value: leaf, null, or reference.
    Resolved(StoreValue),
    /// Unidentified object, embedded by value.
    Inline(IncomingObject),
    /// Processed list elements.
    List(Vec<Incoming>),
    /// Value awaiting a custom merge function.
    Pending(Box<PendingMerge>),
}

/// A field value tagged for the custom-merge pass.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PendingMerge {
    pub(crate) field_name: String,
    pub(crate) store_field_name: String,
    pub(crate) typename: Option<String>,
    pub(crate) arguments: Option<Map<String, Value>>,
    pub(crate) value: Incoming,
}

impl Incoming {
    /// Combine two values written under the same key in one selection walk.
    pub(crate) fn combine(self, next: Self) -> Self {
        match (self, next) {
            (Self::Inline(mut a), Self::Inline(b)) => {
                for (key, value) in b {
                    insert_field(&mut a, key, value);
                }
                Self::Inline(a)
            }
            (Self::Pending(p), Self::Pending(q)) => {
                let PendingMerge { value, .. } = *q;
                p.map_value(|current| current.combine(value))
            }
            (Self::Pending(p), other) => p.map_value(|current| current.combine(other)),
            (other, Self::Pending(p)) => p.map_value(|current| other.combine(current)),
            (Self::Resolved(a), Self::Resolved(b)) => Self::Resolved(merge_values(&a, &b)),
            (_, next) => next,
        }
    }

    fn has_pending(&self) -> bool {
        match self {
            Self::Resolved(_) => false,
            Self::Pending(_) => true,
            Self::Inline(map) => map.values().any(Self::has_pending),
            Self::List(items) => items.iter().any(Self::has_pending),
        }
    }

    /// Conversion for subtrees that hold no pending merges.
    fn into_store_value(self) -> StoreValue {
        match self {
            Self::Resolved(v) => v,
            Self::Inline(map) => StoreValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, v.into_store_value()))
                    .collect(),
            ),
            Self::List(items) => {
                StoreValue::List(items.into_iter().map(Self::into_store_value).collect())
            }
            Self::Pending(p) => p.value.into_store_value(),
        }
    }
}

impl PendingMerge {
    fn map_value(self: Box<Self>, f: impl FnOnce(Incoming) -> Incoming) -> Incoming {
        let mut pending = *self;
        pending.value = f(pending.value);
        Incoming::Pending(Box::new(pending))
    }
}

/// Merge `value` into `fields[key]`.
pub(crate) fn insert_field(fields: &mut IncomingObject, key: String, value: Incoming) {
    let next = match fields.remove(&key) {
        Some(current) => current.combine(value),
        None => value,
    };
    fields.insert(key, next);
}

/// Everything the custom-merge pass needs besides the values themselves.
pub(crate) struct MergePass<'a> {
    pub(crate) store: &'a dyn NormalizedStore,
    pub(crate) policy: &'a dyn CachePolicy,
    pub(crate) variables: &'a Variables,
}

/// Resolve an entity's accumulated fields into a storable record.
///
/// `existing` is the container the fields will be merged into (a reference
/// to the entity itself at the top level). Custom merge functions receive the
/// value currently stored at the matching path, and their output is listed in
/// the returned [`Overrides`] so the store keeps it as returned.
pub(crate) fn resolve_fields(
    fields: IncomingObject,
    existing: Option<&StoreValue>,
    pass: &MergePass<'_>,
) -> (StoreObject, Overrides) {
    let mut record = StoreObject::new();
    let mut overrides = Overrides::new();
    for (key, value) in fields {
        if !value.has_pending() {
            record.insert(key, value.into_store_value());
            continue;
        }
        let current = existing.and_then(|e| field_value(pass.store, e, &key));
        let (resolved, applied) = resolve(value, current.as_ref(), pass);
        match applied {
            Applied::Merge => {}
            Applied::Replace => overrides.replace(key.clone()),
            Applied::Nested(inner) => overrides.nest(key.clone(), inner),
        }
        record.insert(key, resolved);
    }
    (record, overrides)
}

/// How a resolved value is to be combined with what is stored.
enum Applied {
    Merge,
    Replace,
    Nested(Overrides),
}

fn resolve(
    value: Incoming,
    existing: Option<&StoreValue>,
    pass: &MergePass<'_>,
) -> (StoreValue, Applied) {
    match value {
        Incoming::Resolved(v) => (v, Applied::Merge),
        Incoming::Inline(map) => {
            let (object, inner) = resolve_fields(map, existing, pass);
            (StoreValue::Object(object), Applied::Nested(inner))
        }
        // Lists replace wholesale under the default merge anyway.
        Incoming::List(items) => (
            StoreValue::List(
                items
                    .into_iter()
                    .map(|item| resolve(item, None, pass).0)
                    .collect(),
            ),
            Applied::Merge,
        ),
        Incoming::Pending(pending) => {
            let PendingMerge {
                field_name,
                store_field_name,
                typename,
                arguments,
                value,
            } = *pending;
            let (incoming, applied) = resolve(value, existing, pass);
            match pass.policy.merge_function(typename.as_deref(), &field_name) {
                Some(merge) => {
                    let ctx = MergeContext {
                        field_name: &field_name,
                        store_field_name: &store_field_name,
                        typename: typename.as_deref(),
                        arguments: arguments.as_ref(),
                        variables: pass.variables,
                    };
                    (merge(existing, incoming, &ctx), Applied::Replace)
                }
                None => (incoming, applied),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::policy::TypePolicies;
    use crate::store::MemoryStore;
    use crate::value::Reference;
    use std::sync::Arc;

    fn pending(field: &str, value: Incoming) -> Incoming {
        Incoming::Pending(Box::new(PendingMerge {
            field_name: field.into(),
            store_field_name: field.into(),
            typename: Some("Todo".into()),
            arguments: None,
            value,
        }))
    }

    fn list(values: &[i64]) -> StoreValue {
        StoreValue::List(values.iter().map(|n| StoreValue::Number((*n).into())).collect())
    }

    #[test]
    fn combine_inline_objects_unions_fields() {
        let mut a = IncomingObject::new();
        a.insert("x".into(), Incoming::Resolved(StoreValue::from("1")));
        let mut b = IncomingObject::new();
        b.insert("y".into(), Incoming::Resolved(StoreValue::from("2")));
        let Incoming::Inline(merged) = Incoming::Inline(a).combine(Incoming::Inline(b)) else {
            panic!("expected inline");
        };
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn pending_wins_over_resolved_and_keeps_both_values() {
        let combined = Incoming::Resolved(StoreValue::Null).combine(pending("tags", Incoming::Resolved(list(&[1]))));
        assert!(matches!(combined, Incoming::Pending(_)));
    }

    #[test]
    fn merge_function_sees_stored_value() {
        let store = MemoryStore::new();
        let mut seed = StoreObject::new();
        seed.insert("tags".into(), list(&[1, 2]));
        store.merge("Todo:1", seed);

        let policy = TypePolicies::new().merge_field(
            "Todo",
            "tags",
            Arc::new(|existing: Option<&StoreValue>, incoming: StoreValue, _: &MergeContext<'_>| {
                let mut out = match existing {
                    Some(StoreValue::List(items)) => items.clone(),
                    _ => Vec::new(),
                };
                if let StoreValue::List(items) = incoming {
                    out.extend(items);
                }
                StoreValue::List(out)
            }),
        );
        let variables = Variables::new();
        let pass = MergePass { store: &store, policy: &policy, variables: &variables };

        let mut fields = IncomingObject::new();
        fields.insert("tags".into(), pending("tags", Incoming::Resolved(list(&[3]))));
        let entity = StoreValue::Reference(Reference::new("Todo:1"));
        let (record, overrides) = resolve_fields(fields, Some(&entity), &pass);
        assert_eq!(record["tags"], list(&[1, 2, 3]));
        let mut expected = Overrides::new();
        expected.replace("tags");
        assert_eq!(overrides, expected);
    }

    #[test]
    fn nested_pending_inside_inline_object_is_resolved() {
        let store = MemoryStore::new();
        let mut seed = StoreObject::new();
        let mut meta = StoreObject::new();
        meta.insert("count".into(), StoreValue::Number(4.into()));
        seed.insert("meta".into(), StoreValue::Object(meta));
        store.merge("Todo:1", seed);

        let policy = TypePolicies::new().merge_field(
            "Todo",
            "count",
            Arc::new(|existing: Option<&StoreValue>, incoming: StoreValue, _: &MergeContext<'_>| {
                let old = match existing {
                    Some(StoreValue::Number(n)) => n.as_i64().unwrap_or(0),
                    _ => 0,
                };
                let new = match incoming {
                    StoreValue::Number(n) => n.as_i64().unwrap_or(0),
                    _ => 0,
                };
                StoreValue::Number((old + new).into())
            }),
        );
        let variables = Variables::new();
        let pass = MergePass { store: &store, policy: &policy, variables: &variables };

        let mut inner = IncomingObject::new();
        inner.insert("count".into(), pending("count", Incoming::Resolved(StoreValue::Number(1.into()))));
        let mut fields = IncomingObject::new();
        fields.insert("meta".into(), Incoming::Inline(inner));
        let entity = StoreValue::Reference(Reference::new("Todo:1"));
        let (record, overrides) = resolve_fields(fields, Some(&entity), &pass);
        assert!(!overrides.is_empty());
        assert_eq!(record["meta"].as_object().unwrap()["count"], StoreValue::Number(5.into()));
    }
}
