// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Stored value model: entity records, inline objects, and references.
//!
//! Raw results arrive as [`serde_json::Value`] trees. Everything the store
//! persists is a [`StoreValue`], which differs from raw JSON in one way that
//! matters: a [`Reference`] is a distinct variant, so it can never be confused
//! with an ordinary object that happens to carry a `__ref` key.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::ser::{Serialize, Serializer};
use serde::Deserialize;
use serde_json::{Map, Number, Value};

/// Field name carrying an object's concrete type.
pub const TYPENAME_FIELD: &str = "__typename";

/// Key used when a [`Reference`] is rendered as JSON.
pub const REF_KEY: &str = "__ref";

/// Opaque handle to an entity record stored under its own identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "__ref")]
    id: String,
}

impl Reference {
    /// Create a reference to the entity stored under `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Identifier of the referenced entity.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{\"{REF_KEY}\":\"{}\"}}", self.id)
    }
}

/// A flat record: store-field-key to stored value, in deterministic key order.
pub type StoreObject = BTreeMap<String, StoreValue>;

/// Value persisted in an entity record.
///
/// `Shared` holds a container leaf (list or object without a selection set)
/// behind one `Arc` so repeated clones of the record stay cheap. The merge
/// function treats it as atomic, like a scalar.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreValue {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(Number),
    /// JSON string.
    String(String),
    /// Ordered sequence; merged by wholesale replacement.
    List(Vec<StoreValue>),
    /// Inline object embedded by value in its parent.
    Object(StoreObject),
    /// Pointer to an independently stored entity.
    Reference(Reference),
    /// Container leaf stored without structural copy.
    Shared(Arc<Value>),
}

impl StoreValue {
    /// Structural deep copy of a raw JSON value.
    ///
    /// Objects shaped like `{"__ref": "<id>"}` become [`StoreValue::Reference`].
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.clone()),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => match reference_in(map) {
                Some(reference) => Self::Reference(reference),
                None => Self::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Self::from_json(v)))
                        .collect(),
                ),
            },
        }
    }

    /// Scalars are copied inline; containers are cloned once into an `Arc`.
    ///
    /// The write path only borrows the result tree, so that one clone is
    /// unavoidable here. What `Shared` saves is the per-key conversion into
    /// [`StoreValue`] and every later copy: cloning the stored value, merging
    /// it, or reading it back through [`NormalizedStore::get`](crate::NormalizedStore::get)
    /// only bumps the reference count.
    pub fn shared(value: &Value) -> Self {
        match value {
            Value::Array(_) | Value::Object(_) => Self::Shared(Arc::new(value.clone())),
            scalar => Self::from_json(scalar),
        }
    }

    /// Render as JSON; references become `{"__ref": id}`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(map) => Value::Object(object_to_json(map)),
            Self::Reference(r) => {
                let mut map = Map::new();
                map.insert(REF_KEY.to_owned(), Value::String(r.id.clone()));
                Value::Object(map)
            }
            Self::Shared(v) => (**v).clone(),
        }
    }

    /// Borrow the inline object, if this is one.
    pub fn as_object(&self) -> Option<&StoreObject> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow the reference, if this is one.
    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Returns `true` for [`StoreValue::Reference`].
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_))
    }

    /// Borrow the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The `__typename` of an inline object.
    pub fn typename(&self) -> Option<&str> {
        self.as_object()
            .and_then(|map| map.get(TYPENAME_FIELD))
            .and_then(Self::as_str)
    }
}

impl From<&str> for StoreValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for StoreValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Reference> for StoreValue {
    fn from(value: Reference) -> Self {
        Self::Reference(value)
    }
}

impl From<StoreObject> for StoreValue {
    fn from(value: StoreObject) -> Self {
        Self::Object(value)
    }
}

impl Serialize for StoreValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::String(s) => serializer.serialize_str(s),
            Self::List(items) => items.serialize(serializer),
            Self::Object(map) => map.serialize(serializer),
            Self::Reference(r) => r.serialize(serializer),
            Self::Shared(v) => (**v).serialize(serializer),
        }
    }
}

/// Render a record as a JSON object.
pub fn object_to_json(object: &StoreObject) -> Map<String, Value> {
    object
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect()
}

fn reference_in(map: &Map<String, Value>) -> Option<Reference> {
    if map.len() != 1 {
        return None;
    }
    match map.get(REF_KEY) {
        Some(Value::String(id)) => Some(Reference::new(id.clone())),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ref_shaped_json_becomes_reference() {
        let v = StoreValue::from_json(&json!({"__ref": "Todo:1"}));
        assert_eq!(v, StoreValue::Reference(Reference::new("Todo:1")));
        assert_eq!(v.to_json(), json!({"__ref": "Todo:1"}));
    }

    #[test]
    fn object_with_extra_keys_is_not_a_reference() {
        let v = StoreValue::from_json(&json!({"__ref": "Todo:1", "text": "a"}));
        assert!(!v.is_reference());
        assert_eq!(v.as_object().unwrap().len(), 2);
    }

    #[test]
    fn shared_wraps_only_containers() {
        assert_eq!(StoreValue::shared(&json!(3)), StoreValue::from_json(&json!(3)));
        let list = StoreValue::shared(&json!([1, 2]));
        assert!(matches!(list, StoreValue::Shared(_)));
        assert_eq!(list.to_json(), json!([1, 2]));
    }

    #[test]
    fn shared_container_is_not_copied_again_by_the_store() {
        use crate::{MemoryStore, NormalizedStore};

        let store = MemoryStore::new();
        let mut record = StoreObject::new();
        record.insert("blob".into(), StoreValue::shared(&json!({"a": [1, 2]})));
        store.merge("Todo:1", record);
        let first = store.get("Todo:1", "blob");
        let second = store.get("Todo:1", "blob");
        let (Some(StoreValue::Shared(a)), Some(StoreValue::Shared(b))) = (first, second) else {
            panic!("expected shared leaves");
        };
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn serialize_matches_to_json() {
        let v = StoreValue::from_json(&json!({
            "__typename": "Todo",
            "owner": {"__ref": "User:7"},
            "tags": ["x", null]
        }));
        assert_eq!(serde_json::to_value(&v).unwrap(), v.to_json());
        assert_eq!(v.typename(), Some("Todo"));
    }
}
