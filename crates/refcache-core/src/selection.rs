// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Query document model consumed by the writer.
//!
//! Documents arrive already parsed: this module only describes their shape and
//! the handful of derivations the write path needs (response keys, store
//! field keys, directive-based inclusion, typename discovery).
//!
//! Selection sets are compared by address, never structurally. The writer
//! relies on the document being borrowed immutably for the duration of a
//! write so that addresses stay stable.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::WriteError;
use crate::policy::{ROOT_MUTATION, ROOT_QUERY, ROOT_SUBSCRIPTION};
use crate::value::TYPENAME_FIELD;

/// Resolved variable bindings for one write.
pub type Variables = Map<String, Value>;

/// Fragment name to definition, borrowed from the document.
pub type FragmentMap<'a> = HashMap<&'a str, &'a FragmentDefinition>;

/// Directives that never contribute to a store field key.
const BUILTIN_DIRECTIVES: &[&str] = &[
    "connection",
    "include",
    "skip",
    "client",
    "rest",
    "export",
    "defer",
];

/// Operation flavour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Read operation rooted at `ROOT_QUERY`.
    #[default]
    Query,
    /// Write operation rooted at `ROOT_MUTATION`.
    Mutation,
    /// Streaming operation rooted at `ROOT_SUBSCRIPTION`.
    Subscription,
}

impl OperationKind {
    /// Well-known root id results of this kind are written under.
    pub fn root_id(self) -> &'static str {
        match self {
            Self::Query => ROOT_QUERY,
            Self::Mutation => ROOT_MUTATION,
            Self::Subscription => ROOT_SUBSCRIPTION,
        }
    }
}

/// Declared operation variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    /// Variable name without the `$` sigil.
    pub name: String,
    /// Default used when the caller supplies no binding.
    #[serde(default)]
    pub default_value: Option<Value>,
}

/// The single executable operation of a document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation flavour.
    #[serde(default)]
    pub kind: OperationKind,
    /// Optional operation name.
    #[serde(default)]
    pub name: Option<String>,
    /// Declared variables.
    #[serde(default)]
    pub variable_definitions: Vec<VariableDefinition>,
    /// Top-level selections.
    pub selection_set: SelectionSet,
}

impl Operation {
    /// Variables that carry a declared default.
    pub fn default_variables(&self) -> Variables {
        self.variable_definitions
            .iter()
            .filter_map(|def| {
                def.default_value
                    .as_ref()
                    .map(|v| (def.name.clone(), v.clone()))
            })
            .collect()
    }
}

/// Named fragment with a type condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentDefinition {
    /// Fragment name referenced by spreads.
    pub name: String,
    /// Type the fragment applies to.
    pub type_condition: String,
    /// Fragment body.
    pub selection_set: SelectionSet,
}

/// A parsed document: one operation plus its fragment definitions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDocument {
    /// The operation to write against.
    pub operation: Operation,
    /// Fragment definitions available to spreads.
    #[serde(default)]
    pub fragments: Vec<FragmentDefinition>,
}

impl QueryDocument {
    /// Query document with the given top-level selections.
    pub fn query(selections: Vec<Selection>) -> Self {
        Self {
            operation: Operation {
                selection_set: SelectionSet::new(selections),
                ..Operation::default()
            },
            fragments: Vec::new(),
        }
    }

    /// Add a fragment definition.
    pub fn with_fragment(
        mut self,
        name: impl Into<String>,
        type_condition: impl Into<String>,
        selections: Vec<Selection>,
    ) -> Self {
        self.fragments.push(FragmentDefinition {
            name: name.into(),
            type_condition: type_condition.into(),
            selection_set: SelectionSet::new(selections),
        });
        self
    }

    /// Declare a variable with an optional default.
    pub fn with_variable(mut self, name: impl Into<String>, default_value: Option<Value>) -> Self {
        self.operation.variable_definitions.push(VariableDefinition {
            name: name.into(),
            default_value,
        });
        self
    }

    /// Borrowed lookup table of fragment definitions.
    pub fn fragment_map(&self) -> FragmentMap<'_> {
        self.fragments
            .iter()
            .map(|def| (def.name.as_str(), def))
            .collect()
    }
}

/// Ordered list of selections.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionSet {
    /// Selections in document order.
    pub selections: Vec<Selection>,
}

impl SelectionSet {
    /// Wrap a list of selections.
    pub fn new(selections: Vec<Selection>) -> Self {
        Self { selections }
    }
}

/// One entry of a selection set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    /// A field, possibly with a nested selection set.
    Field(Field),
    /// `...Name`
    FragmentSpread(FragmentSpread),
    /// `... on Type { ... }`
    InlineFragment(InlineFragment),
}

impl Selection {
    /// Leaf field shorthand.
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(Field::new(name))
    }

    /// Field with a nested selection set.
    pub fn object(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::Field(Field::new(name).with_selections(selections))
    }

    /// Named fragment spread.
    pub fn spread(name: impl Into<String>) -> Self {
        Self::FragmentSpread(FragmentSpread {
            name: name.into(),
            directives: Vec::new(),
        })
    }

    /// Inline fragment, optionally type-conditioned.
    pub fn inline(type_condition: Option<&str>, selections: Vec<Selection>) -> Self {
        Self::InlineFragment(InlineFragment {
            type_condition: type_condition.map(str::to_owned),
            directives: Vec::new(),
            selection_set: SelectionSet::new(selections),
        })
    }

    /// Directives attached to this selection.
    pub fn directives(&self) -> &[Directive] {
        match self {
            Self::Field(f) => &f.directives,
            Self::FragmentSpread(s) => &s.directives,
            Self::InlineFragment(i) => &i.directives,
        }
    }
}

/// Field selection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Schema field name.
    pub name: String,
    /// Response alias.
    #[serde(default)]
    pub alias: Option<String>,
    /// Arguments affecting field identity.
    #[serde(default)]
    pub arguments: BTreeMap<String, InputValue>,
    /// Attached directives.
    #[serde(default)]
    pub directives: Vec<Directive>,
    /// Nested selections for object-typed fields.
    #[serde(default)]
    pub selection_set: Option<SelectionSet>,
}

impl Field {
    /// Bare field with no alias, arguments, or directives.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            arguments: BTreeMap::new(),
            directives: Vec::new(),
            selection_set: None,
        }
    }

    /// Set the response alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Add an argument.
    pub fn with_argument(mut self, name: impl Into<String>, value: InputValue) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }

    /// Attach a directive.
    pub fn with_directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }

    /// Set the nested selection set.
    pub fn with_selections(mut self, selections: Vec<Selection>) -> Self {
        self.selection_set = Some(SelectionSet::new(selections));
        self
    }

    /// Key under which the value appears in a result object.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Arguments with variables substituted, or `None` when there are none.
    pub fn resolved_arguments(&self, variables: &Variables) -> Option<Map<String, Value>> {
        resolve_arguments(&self.arguments, variables)
    }

    /// Returns `true` if any of `names` is attached.
    pub fn has_any_directive(&self, names: &[&str]) -> bool {
        self.directives
            .iter()
            .any(|d| names.contains(&d.name.as_str()))
    }
}

impl From<Field> for Selection {
    fn from(field: Field) -> Self {
        Self::Field(field)
    }
}

/// `...Name` spread.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentSpread {
    /// Referenced fragment name.
    pub name: String,
    /// Attached directives.
    #[serde(default)]
    pub directives: Vec<Directive>,
}

/// `... on Type { ... }` fragment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InlineFragment {
    /// Optional type condition; absent means "always applies".
    #[serde(default)]
    pub type_condition: Option<String>,
    /// Attached directives.
    #[serde(default)]
    pub directives: Vec<Directive>,
    /// Fragment body.
    pub selection_set: SelectionSet,
}

/// `@name(args)` annotation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    /// Directive name without `@`.
    pub name: String,
    /// Directive arguments.
    #[serde(default)]
    pub arguments: BTreeMap<String, InputValue>,
}

impl Directive {
    /// Directive without arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: BTreeMap::new(),
        }
    }

    /// Add an argument.
    pub fn with_argument(mut self, name: impl Into<String>, value: InputValue) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }
}

/// Argument value as written in the document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputValue {
    /// `$name`
    Variable(String),
    /// Constant JSON.
    Literal(Value),
    /// List literal that may embed variables.
    List(Vec<InputValue>),
    /// Object literal that may embed variables.
    Object(BTreeMap<String, InputValue>),
}

impl InputValue {
    /// Constant shorthand.
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Variable shorthand.
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    /// Substitute variables. Unbound variables resolve to `null`.
    pub fn resolve(&self, variables: &Variables) -> Value {
        match self {
            Self::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
            Self::Literal(v) => v.clone(),
            Self::List(items) => Value::Array(items.iter().map(|i| i.resolve(variables)).collect()),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(variables)))
                    .collect(),
            ),
        }
    }
}

fn resolve_arguments(
    arguments: &BTreeMap<String, InputValue>,
    variables: &Variables,
) -> Option<Map<String, Value>> {
    if arguments.is_empty() {
        return None;
    }
    Some(
        arguments
            .iter()
            .map(|(k, v)| (k.clone(), v.resolve(variables)))
            .collect(),
    )
}

/// Evaluate `@skip(if:)` and `@include(if:)`.
///
/// # Errors
///
/// [`WriteError::InvalidDirective`] when `if` is missing or does not resolve
/// to a boolean.
pub fn should_include(directives: &[Directive], variables: &Variables) -> Result<bool, WriteError> {
    for directive in directives {
        let skip = match directive.name.as_str() {
            "skip" => true,
            "include" => false,
            _ => continue,
        };
        let condition = directive
            .arguments
            .get("if")
            .map(|v| v.resolve(variables));
        let Some(Value::Bool(condition)) = condition else {
            return Err(WriteError::InvalidDirective {
                directive: directive.name.clone(),
                reason: "`if` must resolve to a boolean".into(),
            });
        };
        if condition == skip {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Storage key for a field: name plus identity-affecting arguments and directives.
///
/// `@connection(key:)` replaces the field name and keeps only the arguments
/// named in its optional `filter` list.
pub fn store_key_name(
    field_name: &str,
    args: Option<&Map<String, Value>>,
    directives: &[Directive],
    variables: &Variables,
) -> String {
    if let Some(connection) = directives.iter().find(|d| d.name == "connection") {
        if let Some(Value::String(key)) = connection.arguments.get("key").map(|v| v.resolve(variables)) {
            let filter = connection.arguments.get("filter").map(|v| v.resolve(variables));
            let filtered: Option<Map<String, Value>> = match (filter, args) {
                (Some(Value::Array(names)), Some(args)) => {
                    let kept: Map<String, Value> = names
                        .iter()
                        .filter_map(Value::as_str)
                        .filter_map(|n| args.get(n).map(|v| (n.to_owned(), v.clone())))
                        .collect();
                    (!kept.is_empty()).then_some(kept)
                }
                _ => None,
            };
            return match filtered {
                Some(kept) => format!("{key}({})", Value::Object(kept)),
                None => key,
            };
        }
    }

    let mut name = field_name.to_owned();
    if let Some(args) = args.filter(|a| !a.is_empty()) {
        name.push('(');
        name.push_str(&Value::Object(args.clone()).to_string());
        name.push(')');
    }
    for directive in directives {
        if BUILTIN_DIRECTIVES.contains(&directive.name.as_str()) {
            continue;
        }
        name.push('@');
        name.push_str(&directive.name);
        if let Some(resolved) = resolve_arguments(&directive.arguments, variables) {
            name.push('(');
            name.push_str(&Value::Object(resolved).to_string());
            name.push(')');
        }
    }
    name
}

/// Leading identifier of a store field key (`"todos({\"first\":2})"` -> `"todos"`).
pub fn field_name_from_store_name(store_field_name: &str) -> &str {
    let end = store_field_name
        .char_indices()
        .find(|&(i, c)| !(c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())))
        .map_or(store_field_name.len(), |(i, _)| i);
    &store_field_name[..end]
}

/// Discover the concrete type of a result object.
///
/// Looks at `__typename` directly, then at an aliased `__typename` selection,
/// then through fragments.
pub fn typename_from_result<'r>(
    result: &'r Map<String, Value>,
    selection_set: &SelectionSet,
    fragments: &FragmentMap<'_>,
) -> Option<&'r str> {
    if let Some(Value::String(name)) = result.get(TYPENAME_FIELD) {
        return Some(name);
    }
    for selection in &selection_set.selections {
        match selection {
            Selection::Field(field) if field.name == TYPENAME_FIELD => {
                if let Some(Value::String(name)) = result.get(field.response_key()) {
                    return Some(name);
                }
            }
            Selection::Field(_) => {}
            Selection::FragmentSpread(spread) => {
                if let Some(def) = fragments.get(spread.name.as_str()) {
                    if let Some(name) = typename_from_result(result, &def.selection_set, fragments) {
                        return Some(name);
                    }
                }
            }
            Selection::InlineFragment(inline) => {
                if let Some(name) = typename_from_result(result, &inline.selection_set, fragments) {
                    return Some(name);
                }
            }
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(v: Value) -> Variables {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn store_key_sorts_arguments() {
        let args = vars(json!({"b": 2, "a": {"y": 1, "x": 0}}));
        let key = store_key_name("todos", Some(&args), &[], &Variables::new());
        assert_eq!(key, r#"todos({"a":{"x":0,"y":1},"b":2})"#);
    }

    #[test]
    fn store_key_without_arguments_is_the_name() {
        assert_eq!(store_key_name("id", None, &[], &Variables::new()), "id");
    }

    #[test]
    fn connection_directive_replaces_name_and_filters() {
        let args = vars(json!({"first": 10, "type": "open"}));
        let conn = Directive::new("connection")
            .with_argument("key", InputValue::literal("feed"))
            .with_argument("filter", InputValue::literal(json!(["type"])));
        let key = store_key_name("todos", Some(&args), &[conn], &Variables::new());
        assert_eq!(key, r#"feed({"type":"open"})"#);
    }

    #[test]
    fn custom_directive_is_appended_builtin_is_not() {
        let dirs = [
            Directive::new("client"),
            Directive::new("lang").with_argument("code", InputValue::variable("l")),
        ];
        let key = store_key_name("title", None, &dirs, &vars(json!({"l": "fr"})));
        assert_eq!(key, r#"title@lang({"code":"fr"})"#);
    }

    #[test]
    fn field_name_prefix() {
        assert_eq!(field_name_from_store_name(r#"todos({"first":2})"#), "todos");
        assert_eq!(field_name_from_store_name("title@lang"), "title");
        assert_eq!(field_name_from_store_name("_id2"), "_id2");
    }

    #[test]
    fn skip_and_include() {
        let v = vars(json!({"yes": true, "no": false}));
        let skip = Directive::new("skip").with_argument("if", InputValue::variable("yes"));
        let include = Directive::new("include").with_argument("if", InputValue::variable("no"));
        assert!(!should_include(&[skip], &v).unwrap());
        assert!(!should_include(&[include], &v).unwrap());
        assert!(should_include(&[Directive::new("client")], &v).unwrap());
    }

    #[test]
    fn skip_with_unbound_variable_is_an_error() {
        let skip = Directive::new("skip").with_argument("if", InputValue::variable("missing"));
        let err = should_include(&[skip], &Variables::new()).unwrap_err();
        assert!(matches!(err, WriteError::InvalidDirective { .. }));
    }

    #[test]
    fn typename_through_alias_and_fragment() {
        let doc = QueryDocument::query(vec![]).with_fragment(
            "T",
            "Todo",
            vec![Field::new("__typename").with_alias("kind").into()],
        );
        let fragments = doc.fragment_map();
        let result = vars(json!({"kind": "Todo"}));
        let set = SelectionSet::new(vec![Selection::spread("T")]);
        assert_eq!(typename_from_result(&result, &set, &fragments), Some("Todo"));
    }

    #[test]
    fn defaults_are_collected() {
        let doc = QueryDocument::query(vec![])
            .with_variable("first", Some(json!(5)))
            .with_variable("after", None);
        assert_eq!(doc.operation.default_variables(), vars(json!({"first": 5})));
    }

    #[test]
    fn document_deserializes_from_json() {
        let doc: QueryDocument = serde_json::from_value(json!({
            "operation": {
                "selection_set": {"selections": [
                    {"kind": "field", "name": "todo", "arguments": {"id": {"variable": "id"}},
                     "selection_set": {"selections": [{"kind": "field", "name": "id"}]}}
                ]}
            }
        }))
        .unwrap();
        let Selection::Field(todo) = &doc.operation.selection_set.selections[0] else {
            panic!("expected field");
        };
        assert_eq!(
            todo.resolved_arguments(&vars(json!({"id": "1"}))),
            Some(vars(json!({"id": "1"})))
        );
    }
}
