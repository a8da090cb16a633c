// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The normalizing write path.
//!
//! [`StoreWriter::write`] walks a result tree against its query, splits it
//! into entity records keyed by identity, and deep-merges each record into a
//! [`NormalizedStore`]. Objects without an identity are embedded by value in
//! their parent; identified objects are replaced by a [`Reference`].
//!
//! A write is synchronous and runs to completion or to its first error.
//! Records committed before an error stay committed.
//!
//! # Fragment expansion
//!
//! Each selection set is walked with a FIFO worklist. Fragments whose type
//! condition matches push their selections onto the same worklist, and a
//! selection reached twice (the same spread used from two places, say) is
//! only processed once. Fields reached through different selection nodes
//! still land on the same store key and are combined there.
//!
//! # Duplicate work
//!
//! Within one write, applying the same selection set (by address) to the same
//! entity a second time returns the reference without walking anything.
//! Different selection sets describing the same entity are each applied once.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};
use tracing::{debug, instrument, trace};

use crate::config::{CacheConfig, LeafValues};
use crate::error::WriteError;
use crate::guard::{truncate, DataLossGuard};
use crate::incoming::{insert_field, resolve_fields, Incoming, IncomingObject, MergePass, PendingMerge};
use crate::policy::{CachePolicy, ROOT_QUERY};
use crate::ports::{EvictionHook, FreshnessProbe};
use crate::selection::{
    field_name_from_store_name, should_include, typename_from_result, Field, FragmentMap,
    QueryDocument, Selection, SelectionSet, Variables,
};
use crate::store::NormalizedStore;
use crate::value::{Reference, StoreValue, TYPENAME_FIELD};

/// Directives that legitimize a selected field being absent from the result.
const PARTIAL_DATA_DIRECTIVES: &[&str] = &["client", "defer"];

/// Characters of the result object quoted in a missing-field error.
const MISSING_FIELD_SNAPSHOT: usize = 100;

/// One top-level write.
#[derive(Clone, Copy, Debug)]
pub struct WriteRequest<'a> {
    /// Document the result was produced for.
    pub query: &'a QueryDocument,
    /// Result tree; anything other than an object is written as `{}`.
    pub result: &'a Value,
    /// Call-site variables, overriding the operation's defaults.
    pub variables: Option<&'a Variables>,
    /// Identity of the root object, overriding whatever the policy derives.
    pub data_id: Option<&'a str>,
}

impl<'a> WriteRequest<'a> {
    /// Request with no variables and no explicit root id.
    pub fn new(query: &'a QueryDocument, result: &'a Value) -> Self {
        Self {
            query,
            result,
            variables: None,
            data_id: None,
        }
    }

    /// Request rooted at the well-known id of the operation's kind.
    pub fn rooted(query: &'a QueryDocument, result: &'a Value) -> Self {
        Self::new(query, result).with_data_id(query.operation.kind.root_id())
    }

    /// Set call-site variables.
    pub fn with_variables(mut self, variables: &'a Variables) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Set the root identity.
    pub fn with_data_id(mut self, data_id: &'a str) -> Self {
        self.data_id = Some(data_id);
        self
    }
}

/// Per-call state. Never outlives a single [`StoreWriter::write`].
struct WriteContext<'a> {
    store: &'a dyn NormalizedStore,
    variables: Variables,
    fragments: FragmentMap<'a>,
    /// Entity id to addresses of the selection sets already applied to it.
    written: FxHashMap<String, FxHashSet<usize>>,
}

/// Long-lived writer: policy, configuration, and diagnostic state.
pub struct StoreWriter {
    policy: Arc<dyn CachePolicy>,
    config: CacheConfig,
    guard: DataLossGuard,
    eviction: Option<Arc<dyn EvictionHook>>,
    probe: Option<Arc<dyn FreshnessProbe>>,
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter")
            .field("config", &self.config)
            .field("guard", &self.guard)
            .field("eviction", &self.eviction.is_some())
            .field("probe", &self.probe.is_some())
            .finish_non_exhaustive()
    }
}

impl StoreWriter {
    /// Writer with no eviction hook and no freshness probe.
    pub fn new(policy: Arc<dyn CachePolicy>, config: CacheConfig) -> Self {
        let guard = DataLossGuard::new(config.snapshot_limit);
        Self {
            policy,
            config,
            guard,
            eviction: None,
            probe: None,
        }
    }

    /// Notify `hook` after each entity carrying a TTL marker is committed.
    pub fn with_eviction_hook(mut self, hook: Arc<dyn EvictionHook>) -> Self {
        self.eviction = Some(hook);
        self
    }

    /// Consult `probe` before merging an entity.
    ///
    /// Only used when [`CacheConfig::freshness_short_circuit`] is set.
    pub fn with_freshness_probe(mut self, probe: Arc<dyn FreshnessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Data-loss warning state.
    pub fn guard(&self) -> &DataLossGuard {
        &self.guard
    }

    /// Forget every data-loss warning emitted so far.
    pub fn reset_warnings(&self) {
        self.guard.reset();
    }

    /// Normalize `request.result` into `store`.
    ///
    /// Returns the root [`Reference`] when the root object has an identity
    /// (explicit or derived) and retains it as a GC root. Returns `Ok(None)`
    /// when the root is an inline object, in which case nothing is stored
    /// for the root itself.
    ///
    /// # Errors
    ///
    /// - [`WriteError::MissingField`] under strict completeness.
    /// - [`WriteError::UnknownFragment`] for a spread with no definition.
    /// - [`WriteError::InvalidDirective`] for an unevaluable `@skip`/`@include`.
    /// - [`WriteError::Policy`] when identity resolution fails.
    #[instrument(level = "debug", skip_all, fields(data_id = request.data_id))]
    pub fn write(
        &self,
        store: &dyn NormalizedStore,
        request: WriteRequest<'_>,
    ) -> Result<Option<Reference>, WriteError> {
        let mut variables = request.query.operation.default_variables();
        if let Some(call_site) = request.variables {
            variables.extend(call_site.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let empty = Map::new();
        let result = request.result.as_object().unwrap_or(&empty);

        let mut ctx = WriteContext {
            store,
            variables,
            fragments: request.query.fragment_map(),
            written: FxHashMap::default(),
        };
        let root = self.process_selection_set(
            result,
            &request.query.operation.selection_set,
            &mut ctx,
            request.data_id,
        )?;
        match root {
            Incoming::Resolved(StoreValue::Reference(root)) => {
                store.retain(root.id());
                debug!(root = root.id(), entities = ctx.written.len(), "write committed");
                Ok(Some(root))
            }
            _ => {
                debug!("root object has no identity, nothing retained");
                Ok(None)
            }
        }
    }

    fn process_selection_set<'a>(
        &self,
        result: &Map<String, Value>,
        selection_set: &'a SelectionSet,
        ctx: &mut WriteContext<'a>,
        explicit_id: Option<&str>,
    ) -> Result<Incoming, WriteError> {
        let identity = self
            .policy
            .identify(result, selection_set, &ctx.fragments)?;
        let id = explicit_id.map(str::to_owned).or(identity.id);

        if let Some(id) = &id {
            let address = std::ptr::from_ref(selection_set).addr();
            if !ctx.written.entry(id.clone()).or_default().insert(address) {
                trace!(id = id.as_str(), "selection set already applied");
                return Ok(reference(id));
            }
            if self.is_fresh(id, selection_set, result, &ctx.variables) {
                trace!(id = id.as_str(), "entity already fresh");
                return Ok(reference(id));
            }
        }

        let mut fields = IncomingObject::new();
        for (key, value) in identity.key_fields.into_iter().flatten() {
            insert_field(&mut fields, key, Incoming::Resolved(value));
        }

        let typename = self.resolve_typename(id.as_deref(), result, selection_set, ctx);
        if let Some(typename) = &typename {
            insert_field(
                &mut fields,
                TYPENAME_FIELD.to_owned(),
                Incoming::Resolved(StoreValue::from(typename.as_str())),
            );
        }

        let mut work: VecDeque<&'a Selection> = selection_set.selections.iter().collect();
        let mut seen: FxHashSet<usize> = FxHashSet::default();
        while let Some(selection) = work.pop_front() {
            if !seen.insert(std::ptr::from_ref(selection).addr()) {
                continue;
            }
            if !should_include(selection.directives(), &ctx.variables)? {
                continue;
            }
            match selection {
                Selection::Field(field) => {
                    self.process_field(result, field, typename.as_deref(), ctx, &mut fields)?;
                }
                Selection::FragmentSpread(spread) => {
                    let fragment = ctx
                        .fragments
                        .get(spread.name.as_str())
                        .copied()
                        .ok_or_else(|| WriteError::UnknownFragment(spread.name.clone()))?;
                    if self
                        .policy
                        .fragment_matches(Some(fragment.type_condition.as_str()), typename.as_deref())
                    {
                        work.extend(fragment.selection_set.selections.iter());
                    }
                }
                Selection::InlineFragment(inline) => {
                    if self
                        .policy
                        .fragment_matches(inline.type_condition.as_deref(), typename.as_deref())
                    {
                        work.extend(inline.selection_set.selections.iter());
                    }
                }
            }
        }

        let Some(id) = id else {
            return Ok(Incoming::Inline(fields));
        };
        Ok(self.commit(ctx, id, typename.as_deref(), fields))
    }

    fn resolve_typename(
        &self,
        id: Option<&str>,
        result: &Map<String, Value>,
        selection_set: &SelectionSet,
        ctx: &WriteContext<'_>,
    ) -> Option<String> {
        if let Some(root) = id.and_then(|id| self.policy.root_typename(id)) {
            return Some(root.to_owned());
        }
        if let Some(found) = typename_from_result(result, selection_set, &ctx.fragments) {
            return Some(found.to_owned());
        }
        id.and_then(|id| ctx.store.get(id, TYPENAME_FIELD))
            .and_then(|stored| stored.as_str().map(str::to_owned))
    }

    fn is_fresh(
        &self,
        id: &str,
        selection_set: &SelectionSet,
        result: &Map<String, Value>,
        variables: &Variables,
    ) -> bool {
        if !self.config.freshness_short_circuit {
            return false;
        }
        self.probe
            .as_ref()
            .is_some_and(|probe| probe.is_fresh(id, selection_set, result, variables))
    }

    fn process_field<'a>(
        &self,
        result: &Map<String, Value>,
        field: &'a Field,
        typename: Option<&str>,
        ctx: &mut WriteContext<'a>,
        fields: &mut IncomingObject,
    ) -> Result<(), WriteError> {
        let response_key = field.response_key();
        let Some(value) = result.get(response_key) else {
            if self.policy.strict_completeness() && !field.has_any_directive(PARTIAL_DATA_DIRECTIVES) {
                return Err(WriteError::MissingField {
                    field: response_key.to_owned(),
                    snapshot: truncate(
                        &Value::Object(result.clone()).to_string(),
                        MISSING_FIELD_SNAPSHOT,
                    ),
                });
            }
            return Ok(());
        };

        let store_field_name = self
            .policy
            .store_field_name(typename, field, &ctx.variables);
        let processed = self.process_field_value(value, field, ctx)?;
        let incoming = if self.policy.has_merge_function(typename, &field.name) {
            Incoming::Pending(Box::new(PendingMerge {
                field_name: field.name.clone(),
                store_field_name: store_field_name.clone(),
                typename: typename.map(str::to_owned),
                arguments: field.resolved_arguments(&ctx.variables),
                value: processed,
            }))
        } else {
            processed
        };
        insert_field(fields, store_field_name, incoming);
        Ok(())
    }

    fn process_field_value<'a>(
        &self,
        value: &Value,
        field: &'a Field,
        ctx: &mut WriteContext<'a>,
    ) -> Result<Incoming, WriteError> {
        let Some(selection_set) = field.selection_set.as_ref() else {
            return Ok(self.leaf(value));
        };
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| self.process_field_value(item, field, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Incoming::List),
            Value::Object(object) => self.process_selection_set(object, selection_set, ctx, None),
            _ => Ok(self.leaf(value)),
        }
    }

    fn leaf(&self, value: &Value) -> Incoming {
        Incoming::Resolved(match self.config.leaf_values {
            LeafValues::Copy => StoreValue::from_json(value),
            LeafValues::Shared => StoreValue::shared(value),
        })
    }

    fn commit(
        &self,
        ctx: &WriteContext<'_>,
        id: String,
        typename: Option<&str>,
        fields: IncomingObject,
    ) -> Incoming {
        let entity = StoreValue::Reference(Reference::new(id.as_str()));
        let pass = MergePass {
            store: ctx.store,
            policy: self.policy.as_ref(),
            variables: &ctx.variables,
        };
        let (record, overrides) = resolve_fields(fields, Some(&entity), &pass);

        if self.config.diagnostics_enabled() {
            for store_field_name in record.keys() {
                let field_name = field_name_from_store_name(store_field_name);
                if !self.policy.has_merge_function(typename, field_name) {
                    self.guard.check(ctx.store, &id, store_field_name, &record);
                }
            }
        }

        let marker = record.get(&self.config.ttl_field).cloned();
        ctx.store.merge_overriding(&id, record, &overrides);
        trace!(id = id.as_str(), "entity merged");

        if let (Some(hook), Some(marker)) = (&self.eviction, marker) {
            if id != ROOT_QUERY {
                hook.entity_written(&id, &marker);
            }
        }
        Incoming::Resolved(StoreValue::Reference(Reference::new(id)))
    }
}

fn reference(id: &str) -> Incoming {
    Incoming::Resolved(StoreValue::Reference(Reference::new(id)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::TypePolicies;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn writer() -> StoreWriter {
        StoreWriter::new(Arc::new(TypePolicies::new()), CacheConfig::default())
    }

    #[test]
    fn identified_root_is_retained() {
        let store = MemoryStore::new();
        let query = QueryDocument::query(vec![Selection::field("id"), Selection::field("__typename")]);
        let result = json!({"__typename": "Todo", "id": "1"});
        let root = writer().write(&store, WriteRequest::new(&query, &result)).unwrap();
        assert_eq!(root, Some(Reference::new("Todo:1")));
        assert_eq!(store.retain_count("Todo:1"), 1);
    }

    #[test]
    fn inline_root_returns_none_and_stores_nothing() {
        let store = MemoryStore::new();
        let query = QueryDocument::query(vec![Selection::field("text")]);
        let result = json!({"text": "a"});
        assert_eq!(writer().write(&store, WriteRequest::new(&query, &result)).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn non_object_result_writes_empty_root() {
        let store = MemoryStore::new();
        let query = QueryDocument::query(vec![Selection::field("text")]);
        let root = writer()
            .write(&store, WriteRequest::rooted(&query, &Value::Null))
            .unwrap();
        assert_eq!(root, Some(Reference::new(ROOT_QUERY)));
        assert_eq!(store.get(ROOT_QUERY, TYPENAME_FIELD), Some(StoreValue::from("Query")));
    }

    #[test]
    fn call_site_variables_override_defaults() {
        let store = MemoryStore::new();
        let field = Field::new("todos")
            .with_argument("first", crate::selection::InputValue::variable("first"))
            .with_selections(vec![Selection::field("id")]);
        let query = QueryDocument::query(vec![field.into()]).with_variable("first", Some(json!(5)));
        let result = json!({"todos": []});
        let w = writer();
        w.write(&store, WriteRequest::rooted(&query, &result)).unwrap();
        assert!(store.get(ROOT_QUERY, r#"todos({"first":5})"#).is_some());

        let vars = json!({"first": 2}).as_object().cloned().unwrap();
        w.write(&store, WriteRequest::rooted(&query, &result).with_variables(&vars))
            .unwrap();
        assert!(store.get(ROOT_QUERY, r#"todos({"first":2})"#).is_some());
    }

    #[test]
    fn scalar_under_selection_set_is_stored_as_leaf() {
        let store = MemoryStore::new();
        let query = QueryDocument::query(vec![Selection::object("owner", vec![Selection::field("id")])]);
        let result = json!({"owner": 7});
        writer().write(&store, WriteRequest::rooted(&query, &result)).unwrap();
        assert_eq!(store.get(ROOT_QUERY, "owner"), Some(StoreValue::Number(7.into())));
    }
}
