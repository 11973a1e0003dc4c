//! Error types for the entity cache.

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the entity cache.
///
/// Errors raised synchronously by cache operations (`get`, `submit_*`) reach the
/// caller. Errors raised inside a persistence task never do: they are caught by
/// the persist service, logged together with the task's `describe()` output and
/// handed to `PersistAction::on_error`.
#[derive(Debug, Clone)]
pub enum Error {
    /// An argument could not be used.
    ///
    /// Raised when:
    /// - a new entity has no id and no id rule exists for its type
    InvalidArgument(String),

    /// The atomicity fence was violated.
    ///
    /// The caller holds an entity instance that is not the one owned by the
    /// cached handle (stale or foreign instance).
    ///
    /// **Recovery:** re-fetch the entity with `get` and re-apply the change.
    IllegalState(String),

    /// Data access error (database, etc).
    ///
    /// Returned synchronously only from a cache-miss load. Write failures are
    /// reported through the persistence task runner.
    DataAccess(String),

    /// Configuration error during service construction.
    ///
    /// Common causes:
    /// - zero entity cache size or concurrency level
    /// - service created outside a tokio runtime
    ConfigError(String),

    /// Serialization failed while rendering an audit dump.
    SerializationError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Error::DataAccess(msg) => write!(f, "Data access error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
