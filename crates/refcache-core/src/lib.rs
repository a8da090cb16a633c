// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Normalizing write path for a reference-based result cache.
//!
//! A nested query result is decomposed into flat entity records addressed by
//! a stable identity. Wherever an identified object would be embedded, a
//! [`Reference`] is stored instead. Records are deep-merged into a
//! [`NormalizedStore`], so repeated writes of the same entity accumulate
//! fields instead of overwriting them.
//!
//! ```text
//! result tree ──▶ StoreWriter ──▶ CachePolicy (identity, fragments, merges)
//!                     │
//!                     ├──▶ NormalizedStore::merge (one call per entity)
//!                     ├──▶ DataLossGuard (development mode only)
//!                     └──▶ EvictionHook (entities with a TTL marker)
//! ```
//!
//! # Determinism Invariant
//!
//! Identities are a pure function of the result object and policy. Records
//! use ordered maps, so a store snapshot is byte-stable for a given sequence
//! of writes.
#![forbid(unsafe_code)]

pub mod config;
mod error;
pub mod guard;
mod incoming;
pub mod merge;
pub mod policy;
pub mod ports;
pub mod selection;
pub mod store;
pub mod value;
mod writer;

pub use config::{
    BuildMode, CacheConfig, ConfigError, ConfigService, ConfigStore, EvictionConfig, LeafValues,
    CONFIG_KEY,
};
pub use error::{PolicyError, WriteError};
pub use guard::{DataLossGuard, DataLossWarning};
pub use merge::{merge_objects, merge_objects_overriding, merge_values, Overrides};
pub use policy::{
    default_data_id, CachePolicy, FieldPolicy, Identity, KeyFields, KeyFn, MergeContext, MergeFn,
    PolicyConfig, TypePolicies, TypePolicy, ROOT_MUTATION, ROOT_QUERY, ROOT_SUBSCRIPTION,
};
pub use ports::{EvictionHook, FreshnessProbe};
pub use selection::{
    Directive, Field, FragmentDefinition, FragmentSpread, InlineFragment, InputValue, Operation,
    OperationKind, QueryDocument, Selection, SelectionSet, VariableDefinition, Variables,
};
pub use store::{field_value, MemoryStore, NormalizedStore};
pub use value::{Reference, StoreObject, StoreValue, REF_KEY, TYPENAME_FIELD};
pub use writer::{StoreWriter, WriteRequest};
