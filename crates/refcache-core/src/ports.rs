// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ports for collaborators the writer calls out to without depending on them.

use serde_json::{Map, Value};

use crate::selection::{SelectionSet, Variables};
use crate::value::StoreValue;

/// Notified after an entity record carrying a TTL marker has been committed.
///
/// Implementations must not block: the write has already succeeded and its
/// outcome does not depend on what happens here.
pub trait EvictionHook: Send + Sync {
    /// `marker` is the raw value of the configured TTL field.
    fn entity_written(&self, id: &str, marker: &StoreValue);
}

/// Read-side check used to skip merging entities that are already current.
pub trait FreshnessProbe: Send + Sync {
    /// Returns `true` if reading `selection_set` from entity `id` would yield
    /// exactly `result`.
    fn is_fresh(
        &self,
        id: &str,
        selection_set: &SelectionSet,
        result: &Map<String, Value>,
        variables: &Variables,
    ) -> bool;
}
