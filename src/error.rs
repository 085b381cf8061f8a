//! Shared error types for engine lifecycle operations.

use std::sync::PoisonError;
use thiserror::Error;

/// Errors returned by engine lifecycle operations (shutdown, harvest
/// control). Per-sample and per-tick failures are never surfaced through
/// this type; they are logged and swallowed so that sampling stays
/// best-effort.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineError {
    /// The component was already shut down; the operation did nothing.
    #[error("already shut down")]
    AlreadyShutdown,

    /// An unexpected internal failure, including poisoned locks.
    #[error("internal failure: {0}")]
    InternalFailure(String),
}

/// Result type for engine lifecycle operations.
pub type EngineResult<T = ()> = Result<T, EngineError>;

impl<T> From<PoisonError<T>> for EngineError {
    fn from(err: PoisonError<T>) -> Self {
        EngineError::InternalFailure(format!("lock poisoned: {err}"))
    }
}
