// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Normalized record store.
//!
//! [`NormalizedStore`] is the port the writer talks to; [`MemoryStore`] is the
//! in-process implementation. Records are only ever changed through
//! [`NormalizedStore::merge`], which applies the default deep merge, so a
//! write can never drop a field it did not mention. The one exception is a
//! field a custom merge function produced, which the writer passes through
//! [`NormalizedStore::merge_overriding`] to be stored as returned.
//!
//! # Retention
//!
//! Roots are reference counted: every successful top-level write retains its
//! root once, and [`NormalizedStore::gc`] removes every record that is not
//! reachable from a retained root by following [`Reference`] values.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::merge::{merge_objects_overriding, Overrides};
use crate::value::{Reference, StoreObject, StoreValue};

/// Storage port consumed by the writer and the eviction adapter.
///
/// Implementations must make a single record's merge atomic. Merges to
/// different records need not be serialized.
pub trait NormalizedStore: Send + Sync {
    /// Field value of a record, or `None` when either is absent.
    fn get(&self, id: &str, store_field_name: &str) -> Option<StoreValue>;

    /// Full copy of a record.
    fn record(&self, id: &str) -> Option<StoreObject>;

    /// Deep-merge `incoming` into the record stored under `id`, creating it if needed.
    fn merge(&self, id: &str, incoming: StoreObject) {
        self.merge_overriding(id, incoming, &Overrides::new());
    }

    /// [`merge`](Self::merge), storing the fields named in `overrides` as given.
    fn merge_overriding(&self, id: &str, incoming: StoreObject, overrides: &Overrides);

    /// Remove a record. Returns `true` if it existed.
    fn evict(&self, id: &str) -> bool;

    /// Mark `id` as a retained root.
    fn retain(&self, id: &str);

    /// Drop one retention of `id`. No-op if not retained.
    fn release(&self, id: &str);

    /// Remove records unreachable from retained roots. Returns removed ids in order.
    fn gc(&self) -> Vec<String>;
}

/// Resolve `key` on a container that is either an inline object or a reference.
pub fn field_value(
    store: &dyn NormalizedStore,
    container: &StoreValue,
    key: &str,
) -> Option<StoreValue> {
    match container {
        StoreValue::Reference(r) => store.get(r.id(), key),
        StoreValue::Object(map) => map.get(key).cloned(),
        _ => None,
    }
}

/// In-memory [`NormalizedStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    records: BTreeMap<String, StoreObject>,
    roots: BTreeMap<String, usize>,
}

impl MemoryStore {
    /// Empty store with no retained roots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    /// Returns `true` if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    /// Returns `true` if a record exists for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.read().records.contains_key(id)
    }

    /// Retention count for `id` (0 when not retained).
    pub fn retain_count(&self, id: &str) -> usize {
        self.read().roots.get(id).copied().unwrap_or(0)
    }

    /// Copy of every record, keyed by id.
    pub fn snapshot(&self) -> BTreeMap<String, StoreObject> {
        self.read().records.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NormalizedStore for MemoryStore {
    fn get(&self, id: &str, store_field_name: &str) -> Option<StoreValue> {
        self.read()
            .records
            .get(id)
            .and_then(|record| record.get(store_field_name))
            .cloned()
    }

    fn record(&self, id: &str) -> Option<StoreObject> {
        self.read().records.get(id).cloned()
    }

    fn merge_overriding(&self, id: &str, incoming: StoreObject, overrides: &Overrides) {
        let mut inner = self.write();
        let merged = match inner.records.remove(id) {
            Some(existing) => merge_objects_overriding(existing, incoming, overrides),
            None => incoming,
        };
        inner.records.insert(id.to_owned(), merged);
    }

    fn evict(&self, id: &str) -> bool {
        self.write().records.remove(id).is_some()
    }

    fn retain(&self, id: &str) {
        *self.write().roots.entry(id.to_owned()).or_insert(0) += 1;
    }

    fn release(&self, id: &str) {
        let mut inner = self.write();
        if let Some(count) = inner.roots.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                inner.roots.remove(id);
            }
        }
    }

    fn gc(&self) -> Vec<String> {
        let mut inner = self.write();
        let mut reachable: BTreeSet<String> = BTreeSet::new();
        let mut pending: VecDeque<String> = inner.roots.keys().cloned().collect();
        while let Some(id) = pending.pop_front() {
            if !reachable.insert(id.clone()) {
                continue;
            }
            if let Some(record) = inner.records.get(&id) {
                for value in record.values() {
                    collect_references(value, &mut |r| pending.push_back(r.id().to_owned()));
                }
            }
        }
        let removed: Vec<String> = inner
            .records
            .keys()
            .filter(|id| !reachable.contains(*id))
            .cloned()
            .collect();
        for id in &removed {
            inner.records.remove(id);
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "gc reclaimed unreachable records");
        }
        removed
    }
}

fn collect_references(value: &StoreValue, visit: &mut dyn FnMut(&Reference)) {
    match value {
        StoreValue::Reference(r) => visit(r),
        StoreValue::List(items) => items.iter().for_each(|v| collect_references(v, visit)),
        StoreValue::Object(map) => map.values().for_each(|v| collect_references(v, visit)),
        _ => {}
    }
}
