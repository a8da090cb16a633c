// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Errors surfaced by the write path.

use thiserror::Error;

/// Failure raised by a [`CachePolicy`](crate::CachePolicy) while identifying an object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// A configured key field is absent from the result object.
    #[error("[POLICY_MISSING_KEY_FIELD] missing key field `{field}` on object of type {typename}")]
    MissingKeyField {
        /// Type whose key fields were being read.
        typename: String,
        /// The absent key field.
        field: String,
    },
    /// Error raised by a user-supplied identity function.
    #[error("[POLICY_CUSTOM] {0}")]
    Custom(String),
}

/// Errors that abort a write.
///
/// Records merged before the failure stay merged; there is no rollback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// A selected field is absent from the result under strict completeness.
    #[error("[WRITE_MISSING_FIELD] missing field '{field}' in {snapshot}")]
    MissingField {
        /// Response key of the missing field.
        field: String,
        /// Truncated JSON rendering of the result object.
        snapshot: String,
    },
    /// A spread names a fragment the document does not define.
    #[error("[WRITE_UNKNOWN_FRAGMENT] no fragment named {0}")]
    UnknownFragment(String),
    /// A `@skip`/`@include` directive could not be evaluated.
    #[error("[WRITE_INVALID_DIRECTIVE] @{directive}: {reason}")]
    InvalidDirective {
        /// Directive name.
        directive: String,
        /// What was wrong with it.
        reason: String,
    },
    /// Identity resolution failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),
}
