// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canned documents and results for a small todo-list schema.
//!
//! ```text
//! type Query { todo: Todo  todos(status: String): [Todo] }
//! type Todo  { id: ID  text: String  maxAge: Float  owner: User  meta: Meta }
//! type User  { id: ID  name: String }
//! type Meta  { created: String  tags: [String] }   # no identity
//! ```

use std::sync::Arc;

use refcache_core::{
    CacheConfig, CachePolicy, Field, InputValue, QueryDocument, Selection, StoreWriter,
    TypePolicies,
};
use serde_json::{json, Value};

/// `{ todo { id text maxAge } }`
pub fn todo_query() -> QueryDocument {
    QueryDocument::query(vec![Selection::object(
        "todo",
        vec![
            Selection::field("id"),
            Selection::field("__typename"),
            Selection::field("text"),
            Selection::field("maxAge"),
        ],
    )])
}

/// Result for [`todo_query`].
pub fn todo_result(id: &str, text: &str, max_age: u64) -> Value {
    json!({
        "todo": {"__typename": "Todo", "id": id, "text": text, "maxAge": max_age}
    })
}

/// `{ todos(status: $status) { id text owner { id name } meta { created } } }`
pub fn todos_query() -> QueryDocument {
    let todos = Field::new("todos")
        .with_argument("status", InputValue::variable("status"))
        .with_selections(vec![
            Selection::field("__typename"),
            Selection::field("id"),
            Selection::field("text"),
            Selection::object(
                "owner",
                vec![Selection::field("__typename"), Selection::field("id"), Selection::field("name")],
            ),
            Selection::object("meta", vec![Selection::field("created")]),
        ]);
    QueryDocument::query(vec![todos.into()]).with_variable("status", Some(json!("open")))
}

/// Two todos sharing one owner.
pub fn todos_result() -> Value {
    json!({
        "todos": [
            {
                "__typename": "Todo", "id": "1", "text": "a",
                "owner": {"__typename": "User", "id": "u1", "name": "Ada"},
                "meta": {"created": "mon"}
            },
            {
                "__typename": "Todo", "id": "2", "text": "b",
                "owner": {"__typename": "User", "id": "u1", "name": "Ada"},
                "meta": {"created": "tue"}
            }
        ]
    })
}

/// Default policies for the todo schema.
pub fn todo_policies() -> TypePolicies {
    TypePolicies::new().inline("Meta")
}

/// Writer over `policy` with default (development) config.
pub fn writer_with(policy: Arc<dyn CachePolicy>) -> StoreWriter {
    StoreWriter::new(policy, CacheConfig::default())
}
