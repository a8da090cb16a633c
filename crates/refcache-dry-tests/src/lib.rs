// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for refcache crates.
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`doubles`] - Recording eviction hook, counting policy, stub freshness probe
//! - [`fixtures`] - Todo-schema documents, results, and policies
#![forbid(unsafe_code)]

pub mod config;
pub mod doubles;
pub mod fixtures;

// Re-export commonly used items at crate root for convenience
pub use config::InMemoryConfigStore;
pub use doubles::{CountingPolicy, RecordingHook, StubProbe};
pub use fixtures::{todo_policies, todo_query, todo_result, todos_query, todos_result, writer_with};
