//! Error taxonomy for the herder pool and readiness engine.

use thiserror::Error;

/// The kinds of failure exposed by this crate's public operations.
///
/// Mirrors spec section 7: allocation/thread-spawn failure, duplicate
/// registration, lookups against a socket that isn't registered, and
/// operations attempted after teardown has begun.
#[derive(Debug, Error)]
pub enum HerderError {
    /// Allocation, or execution-context (thread) creation, failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Attempted to insert an event item whose key is already present.
    #[error("duplicate registration for {0:?}")]
    Duplicate(crate::socket::RemoteEndpoint),

    /// A removal or modification targeted a socket that isn't registered.
    #[error("not found: {0:?}")]
    NotFound(crate::socket::RemoteEndpoint),

    /// The operation was attempted after teardown began.
    #[error("operation attempted after shutdown")]
    Shutdown,

    /// `dispatch` was called against an empty herder list.
    #[error("no herders available")]
    NoHerders,
}
