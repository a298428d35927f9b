//! Error types for cache operations.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by tiers, the invalidation bus, locks and codecs.
///
/// A missing key is never an error (`Ok(None)`), and neither is a lock
/// timeout (`Ok(false)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Value could not be encoded.
    SerializationError(String),

    /// Stored bytes could not be decoded into the requested type.
    DeserializationError(String),

    /// Envelope magic mismatch or truncated entry.
    InvalidCacheEntry(String),

    /// Envelope schema version differs from the one this build understands.
    VersionMismatch { expected: u32, found: u32 },

    /// Tier I/O failure (connection, protocol, pool exhaustion).
    BackendError(String),

    /// Invalidation bus transport failure.
    BusError(String),

    /// Lock backend failure or misuse of a lock handle.
    LockError(String),

    /// Caller supplied an invalid argument (empty key, zero TTL, ...).
    ValidationError(String),

    /// Invalid or incomplete configuration.
    ConfigError(String),

    /// Named provider was not registered.
    NotFound(String),

    /// Operation exceeded its deadline.
    Timeout(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendError(_) | Error::BusError(_) | Error::LockError(_) | Error::Timeout(_)
        )
    }

    /// Whether the error indicates corrupted or incompatible cached data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::DeserializationError(_)
                | Error::InvalidCacheEntry(_)
                | Error::VersionMismatch { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SerializationError(msg) => write!(f, "serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "deserialization error: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => write!(
                f,
                "cache schema version mismatch: expected {}, found {}",
                expected, found
            ),
            Error::BackendError(msg) => write!(f, "backend error: {}", msg),
            Error::BusError(msg) => write!(f, "invalidation bus error: {}", msg),
            Error::LockError(msg) => write!(f, "lock error: {}", msg),
            Error::ValidationError(msg) => write!(f, "validation error: {}", msg),
            Error::ConfigError(msg) => write!(f, "configuration error: {}", msg),
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::Timeout(msg) => write!(f, "timeout: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
