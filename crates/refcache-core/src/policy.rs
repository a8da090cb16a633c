// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identity, type matching, and per-field policy.
//!
//! The writer treats [`CachePolicy`] as a black box. [`TypePolicies`] is the
//! stock implementation: `<Typename>:<id>` identities by default, explicit key
//! fields or custom key functions per type, root types mapped to the
//! well-known root ids, and a subtype table for fragment matching.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PolicyError;
use crate::selection::{store_key_name, typename_from_result, Field, FragmentMap, SelectionSet, Variables};
use crate::value::{StoreObject, StoreValue};

/// Root id for query results.
pub const ROOT_QUERY: &str = "ROOT_QUERY";
/// Root id for mutation results.
pub const ROOT_MUTATION: &str = "ROOT_MUTATION";
/// Root id for subscription results.
pub const ROOT_SUBSCRIPTION: &str = "ROOT_SUBSCRIPTION";

const ROOTS: [(&str, &str); 3] = [
    (ROOT_QUERY, "Query"),
    (ROOT_MUTATION, "Mutation"),
    (ROOT_SUBSCRIPTION, "Subscription"),
];

/// Outcome of identifying a result object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Identity {
    /// Stable entity id, or `None` for inline objects.
    pub id: Option<String>,
    /// Fields the id was computed from, written even when unrequested.
    pub key_fields: Option<StoreObject>,
}

/// Information handed to a custom merge function.
#[derive(Clone, Copy, Debug)]
pub struct MergeContext<'a> {
    /// Schema field name.
    pub field_name: &'a str,
    /// Key the value is stored under.
    pub store_field_name: &'a str,
    /// Type of the object owning the field.
    pub typename: Option<&'a str>,
    /// Field arguments with variables substituted.
    pub arguments: Option<&'a Map<String, Value>>,
    /// Variables of the current write.
    pub variables: &'a Variables,
}

/// Custom per-field merge: `(existing, incoming, context) -> stored`.
pub type MergeFn =
    Arc<dyn Fn(Option<&StoreValue>, StoreValue, &MergeContext<'_>) -> StoreValue + Send + Sync>;

/// Custom identity function: `(object, typename) -> id`.
pub type KeyFn =
    Arc<dyn Fn(&Map<String, Value>, Option<&str>) -> Result<Option<String>, PolicyError> + Send + Sync>;

/// Injected identity and type-matching capability.
pub trait CachePolicy: Send + Sync {
    /// Derive the identity of `object`. Must be deterministic.
    fn identify(
        &self,
        object: &Map<String, Value>,
        selection_set: &SelectionSet,
        fragments: &FragmentMap<'_>,
    ) -> Result<Identity, PolicyError>;

    /// Canonical typename for a well-known root id.
    fn root_typename(&self, id: &str) -> Option<&str>;

    /// Does a fragment with `type_condition` apply to an object of `typename`?
    fn fragment_matches(&self, type_condition: Option<&str>, typename: Option<&str>) -> bool;

    /// Custom merge function registered for a field.
    fn merge_function(&self, typename: Option<&str>, field_name: &str) -> Option<MergeFn>;

    /// Returns `true` if a custom merge function is registered for a field.
    fn has_merge_function(&self, typename: Option<&str>, field_name: &str) -> bool {
        self.merge_function(typename, field_name).is_some()
    }

    /// Storage key for `field` on an object of `typename`.
    fn store_field_name(&self, typename: Option<&str>, field: &Field, variables: &Variables) -> String;

    /// Whether absent selected fields are an error.
    fn strict_completeness(&self) -> bool;
}

/// How a type derives its identity.
#[derive(Clone, Default)]
pub enum KeyFields {
    /// `<Typename>:<id>` using `id` or `_id`.
    #[default]
    Default,
    /// `<Typename>:<json of the listed fields>`.
    Fields(Vec<String>),
    /// Never identified; always stored inline.
    Inline,
    /// User-supplied function.
    Custom(KeyFn),
}

impl fmt::Debug for KeyFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Fields(fields) => f.debug_tuple("Fields").field(fields).finish(),
            Self::Inline => f.write_str("Inline"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Per-field configuration.
#[derive(Clone, Default)]
pub struct FieldPolicy {
    /// Arguments that participate in the store field key; `None` keeps all.
    pub key_args: Option<Vec<String>>,
    /// Custom merge function.
    pub merge: Option<MergeFn>,
}

impl fmt::Debug for FieldPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldPolicy")
            .field("key_args", &self.key_args)
            .field("merge", &self.merge.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Per-type configuration.
#[derive(Clone, Debug, Default)]
pub struct TypePolicy {
    /// Identity rule.
    pub key_fields: KeyFields,
    /// Field policies by field name.
    pub fields: HashMap<String, FieldPolicy>,
}

/// Declarative, serializable subset of [`TypePolicies`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Key field lists by typename.
    pub key_fields: BTreeMap<String, Vec<String>>,
    /// Types that are never identified.
    pub inline_types: Vec<String>,
    /// Supertype to direct subtypes.
    pub possible_types: BTreeMap<String, Vec<String>>,
    /// `Type.field` to the arguments kept in its store key.
    pub key_args: BTreeMap<String, Vec<String>>,
    /// Fail writes with missing fields.
    pub strict: bool,
}

/// Stock [`CachePolicy`].
#[derive(Clone, Debug, Default)]
pub struct TypePolicies {
    types: HashMap<String, TypePolicy>,
    subtypes: HashMap<String, BTreeSet<String>>,
    strict: bool,
    data_id_from_object: Option<KeyFnDebug>,
}

#[derive(Clone)]
struct KeyFnDebug(KeyFn);

impl fmt::Debug for KeyFnDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyFn(..)")
    }
}

impl TypePolicies {
    /// Policies with default identity for every type.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a declarative config.
    pub fn from_config(config: &PolicyConfig) -> Self {
        let mut policies = Self::new().strict(config.strict);
        for (typename, fields) in &config.key_fields {
            policies = policies.key_fields(typename, fields.iter().map(String::as_str));
        }
        for typename in &config.inline_types {
            policies = policies.inline(typename);
        }
        for (supertype, subtypes) in &config.possible_types {
            policies = policies.possible_types(supertype, subtypes.iter().map(String::as_str));
        }
        for (coordinate, args) in &config.key_args {
            if let Some((typename, field)) = coordinate.split_once('.') {
                policies = policies.key_args(typename, field, args.iter().map(String::as_str));
            }
        }
        policies
    }

    /// Identify `typename` by the listed fields.
    pub fn key_fields<'a>(mut self, typename: &str, fields: impl IntoIterator<Item = &'a str>) -> Self {
        self.type_mut(typename).key_fields =
            KeyFields::Fields(fields.into_iter().map(str::to_owned).collect());
        self
    }

    /// Never identify `typename`.
    pub fn inline(mut self, typename: &str) -> Self {
        self.type_mut(typename).key_fields = KeyFields::Inline;
        self
    }

    /// Identify `typename` with a custom function.
    pub fn key_fn(mut self, typename: &str, key_fn: KeyFn) -> Self {
        self.type_mut(typename).key_fields = KeyFields::Custom(key_fn);
        self
    }

    /// Replace the default `<Typename>:<id>` rule for types without a policy.
    pub fn data_id_from_object(mut self, key_fn: KeyFn) -> Self {
        self.data_id_from_object = Some(KeyFnDebug(key_fn));
        self
    }

    /// Register direct subtypes of `supertype`. Implies strict completeness.
    pub fn possible_types<'a>(mut self, supertype: &str, subtypes: impl IntoIterator<Item = &'a str>) -> Self {
        let entry = self.subtypes.entry(supertype.to_owned()).or_default();
        entry.extend(subtypes.into_iter().map(str::to_owned));
        self.strict = true;
        self
    }

    /// Restrict the arguments that enter `typename.field`'s store key.
    pub fn key_args<'a>(mut self, typename: &str, field: &str, args: impl IntoIterator<Item = &'a str>) -> Self {
        self.field_mut(typename, field).key_args = Some(args.into_iter().map(str::to_owned).collect());
        self
    }

    /// Register a custom merge function for `typename.field`.
    pub fn merge_field(mut self, typename: &str, field: &str, merge: MergeFn) -> Self {
        self.field_mut(typename, field).merge = Some(merge);
        self
    }

    /// Toggle strict completeness.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn type_mut(&mut self, typename: &str) -> &mut TypePolicy {
        self.types.entry(typename.to_owned()).or_default()
    }

    fn field_mut(&mut self, typename: &str, field: &str) -> &mut FieldPolicy {
        self.type_mut(typename).fields.entry(field.to_owned()).or_default()
    }

    fn field_policy(&self, typename: Option<&str>, field_name: &str) -> Option<&FieldPolicy> {
        self.types.get(typename?)?.fields.get(field_name)
    }

    fn is_subtype(&self, supertype: &str, typename: &str) -> bool {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut pending: VecDeque<&str> = VecDeque::from([supertype]);
        while let Some(current) = pending.pop_front() {
            if current == typename {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(subs) = self.subtypes.get(current) {
                pending.extend(subs.iter().map(String::as_str));
            }
        }
        false
    }
}

impl CachePolicy for TypePolicies {
    fn identify(
        &self,
        object: &Map<String, Value>,
        selection_set: &SelectionSet,
        fragments: &FragmentMap<'_>,
    ) -> Result<Identity, PolicyError> {
        let typename = typename_from_result(object, selection_set, fragments);
        if let Some(root) = typename.and_then(root_id_for_typename) {
            return Ok(Identity {
                id: Some(root.to_owned()),
                key_fields: None,
            });
        }

        let rule = typename
            .and_then(|t| self.types.get(t))
            .map(|p| &p.key_fields);
        match rule {
            Some(KeyFields::Fields(fields)) => {
                let typename = typename.unwrap_or_default();
                let mut key_json = Map::new();
                let mut key_fields = StoreObject::new();
                for field in fields {
                    let value = object.get(field).ok_or_else(|| PolicyError::MissingKeyField {
                        typename: typename.to_owned(),
                        field: field.clone(),
                    })?;
                    key_json.insert(field.clone(), value.clone());
                    key_fields.insert(field.clone(), StoreValue::from_json(value));
                }
                Ok(Identity {
                    id: Some(format!("{typename}:{}", Value::Object(key_json))),
                    key_fields: Some(key_fields),
                })
            }
            Some(KeyFields::Inline) => Ok(Identity::default()),
            Some(KeyFields::Custom(key_fn)) => Ok(Identity {
                id: key_fn(object, typename)?,
                key_fields: None,
            }),
            Some(KeyFields::Default) | None => match &self.data_id_from_object {
                Some(KeyFnDebug(key_fn)) => Ok(Identity {
                    id: key_fn(object, typename)?,
                    key_fields: None,
                }),
                None => {
                    let id = default_data_id(object, typename);
                    let key_fields = id.as_ref().and_then(|_| default_key_field(object));
                    Ok(Identity { id, key_fields })
                }
            },
        }
    }

    fn root_typename(&self, id: &str) -> Option<&str> {
        ROOTS.iter().find(|(root, _)| *root == id).map(|(_, t)| *t)
    }

    fn fragment_matches(&self, type_condition: Option<&str>, typename: Option<&str>) -> bool {
        let Some(condition) = type_condition else {
            return true;
        };
        let Some(typename) = typename else {
            return false;
        };
        condition == typename || self.is_subtype(condition, typename)
    }

    fn merge_function(&self, typename: Option<&str>, field_name: &str) -> Option<MergeFn> {
        self.field_policy(typename, field_name)
            .and_then(|p| p.merge.clone())
    }

    fn store_field_name(&self, typename: Option<&str>, field: &Field, variables: &Variables) -> String {
        let mut args = field.resolved_arguments(variables);
        if let (Some(keep), Some(all)) = (
            self.field_policy(typename, &field.name).and_then(|p| p.key_args.as_ref()),
            args.as_mut(),
        ) {
            all.retain(|name, _| keep.contains(name));
        }
        store_key_name(&field.name, args.as_ref(), &field.directives, variables)
    }

    fn strict_completeness(&self) -> bool {
        self.strict
    }
}

fn root_id_for_typename(typename: &str) -> Option<&'static str> {
    ROOTS.iter().find(|(_, t)| *t == typename).map(|(root, _)| *root)
}

/// `<Typename>:<id>` from `id` (or `_id`). Strings and numbers render bare.
pub fn default_data_id(object: &Map<String, Value>, typename: Option<&str>) -> Option<String> {
    let typename = typename?;
    let id = object.get("id").or_else(|| object.get("_id"))?;
    match id {
        Value::Null => None,
        Value::String(s) => Some(format!("{typename}:{s}")),
        Value::Number(n) => Some(format!("{typename}:{n}")),
        other => Some(format!("{typename}:{other}")),
    }
}

/// The `id` (or `_id`) field the default identity was derived from.
fn default_key_field(object: &Map<String, Value>) -> Option<StoreObject> {
    let (name, value) = ["id", "_id"]
        .into_iter()
        .find_map(|name| object.get(name).map(|value| (name, value)))?;
    let mut key = StoreObject::new();
    key.insert(name.to_owned(), StoreValue::from_json(value));
    Some(key)
}
