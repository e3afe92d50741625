//! Crate-wide error taxonomy.

use thiserror::Error;

use crate::types::EntityId;

/// Failures surfaced to callers of the index engine or a key type.
///
/// There is deliberately no `CacheMiss` variant: a miss inside
/// [`crate::tet::cache::TetCache`] is an internal recovery signal, never
/// returned across a public API boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A coordinate fell outside the domain the backend can represent.
    #[error("coordinate out of domain: {0}")]
    OutOfDomain(String),

    /// A level was requested outside `[0, MAX_LEVEL]`.
    #[error("invalid level {level}, must be in [0, {max}]")]
    InvalidLevel {
        /// The level that was requested.
        level: u8,
        /// `MAX_LEVEL` for the backend in question.
        max: u8,
    },

    /// Insertion used an explicit id that is already present.
    #[error("entity {0} already exists")]
    EntityAlreadyExists(EntityId),

    /// Update or remove referenced an id with no `EntityRecord`.
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    /// A query observed its cancellation flag and stopped early.
    ///
    /// The engine's own query paths return their partial result directly
    /// instead of this; the variant exists for callers that need to carry
    /// cancellation through their own error plumbing.
    #[error("query cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
