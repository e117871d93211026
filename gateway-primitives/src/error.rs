//! Shared error definitions for gateway primitives.

use thiserror::Error;

/// Result alias used by the primitive types.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// The identifier was empty or whitespace only.
    #[error("{kind} id must not be empty")]
    EmptyId {
        /// Which identifier kind was rejected.
        kind: &'static str,
    },
}
