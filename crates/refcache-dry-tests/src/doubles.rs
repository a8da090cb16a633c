// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Recording and counting doubles for the writer's collaborators.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use refcache_core::selection::FragmentMap;
use refcache_core::{
    CachePolicy, EvictionHook, Field, FreshnessProbe, Identity, MergeFn, PolicyError,
    SelectionSet, StoreValue, Variables,
};
use serde_json::{Map, Value};

/// [`EvictionHook`] that records every notification in order.
#[derive(Clone, Debug, Default)]
pub struct RecordingHook {
    calls: Arc<Mutex<Vec<(String, StoreValue)>>>,
}

impl RecordingHook {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(entity id, marker)` pairs received so far.
    pub fn calls(&self) -> Vec<(String, StoreValue)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EvictionHook for RecordingHook {
    fn entity_written(&self, id: &str, marker: &StoreValue) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.to_owned(), marker.clone()));
    }
}

/// [`CachePolicy`] wrapper counting how often fields are resolved.
///
/// `store_field_name` runs exactly once per processed field, so
/// [`field_calls`](Self::field_calls) measures how much walking a write did.
pub struct CountingPolicy<P> {
    inner: P,
    field_calls: AtomicUsize,
    identify_calls: AtomicUsize,
}

impl<P> CountingPolicy<P> {
    /// Wrap `inner` with zeroed counters.
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            field_calls: AtomicUsize::new(0),
            identify_calls: AtomicUsize::new(0),
        }
    }

    /// Number of fields processed.
    pub fn field_calls(&self) -> usize {
        self.field_calls.load(Ordering::SeqCst)
    }

    /// Number of objects identified.
    pub fn identify_calls(&self) -> usize {
        self.identify_calls.load(Ordering::SeqCst)
    }
}

impl<P: CachePolicy> CachePolicy for CountingPolicy<P> {
    fn identify(
        &self,
        object: &Map<String, Value>,
        selection_set: &SelectionSet,
        fragments: &FragmentMap<'_>,
    ) -> Result<Identity, PolicyError> {
        self.identify_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.identify(object, selection_set, fragments)
    }

    fn root_typename(&self, id: &str) -> Option<&str> {
        self.inner.root_typename(id)
    }

    fn fragment_matches(&self, type_condition: Option<&str>, typename: Option<&str>) -> bool {
        self.inner.fragment_matches(type_condition, typename)
    }

    fn merge_function(&self, typename: Option<&str>, field_name: &str) -> Option<MergeFn> {
        self.inner.merge_function(typename, field_name)
    }

    fn store_field_name(&self, typename: Option<&str>, field: &Field, variables: &Variables) -> String {
        self.field_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.store_field_name(typename, field, variables)
    }

    fn strict_completeness(&self) -> bool {
        self.inner.strict_completeness()
    }
}

/// [`FreshnessProbe`] with a fixed answer and a call counter.
#[derive(Debug, Default)]
pub struct StubProbe {
    fresh: AtomicBool,
    calls: AtomicUsize,
}

impl StubProbe {
    /// Probe answering `fresh` to every query.
    pub fn answering(fresh: bool) -> Self {
        Self {
            fresh: AtomicBool::new(fresh),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of probes made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FreshnessProbe for StubProbe {
    fn is_fresh(
        &self,
        _id: &str,
        _selection_set: &SelectionSet,
        _result: &Map<String, Value>,
        _variables: &Variables,
    ) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fresh.load(Ordering::SeqCst)
    }
}
