//! Error types shared by the store and all backends.
//!
//! Backends raise these canonical kinds directly and never leak
//! driver-specific error types across the boundary. The store does not
//! wrap or translate them.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical errors raised at the store/backend boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// An object was not found (neither live nor soft-deleted).
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// A store without overwrite, or a move into an existing name.
    #[error("object already exists: {0}")]
    ObjectAlreadyExists(String),

    /// `create()` on a non-empty storage root.
    #[error("backend storage already exists: {0}")]
    BackendAlreadyExists(String),

    /// `open()`/`destroy()` on an uninitialized or missing storage root.
    #[error("backend storage does not exist: {0}")]
    BackendDoesNotExist(String),

    /// An operation that requires an open backend was called on a closed one.
    #[error("backend must be open")]
    BackendMustBeOpen,

    /// `create()`/`destroy()`/`open()` was called on an open backend.
    #[error("backend must not be open")]
    BackendMustNotBeOpen,

    /// The permission overlay rejected an operation.
    #[error("one of permissions '{required}' required for '{name}'")]
    PermissionDenied {
        /// Logical name the operation addressed.
        name: String,
        /// Permission letters of which at least one was required.
        required: String,
    },

    /// The URL dispatcher cannot parse or resolve the scheme.
    #[error("invalid backend storage URL: {0}")]
    InvalidUrl(String),

    /// A key violates the ASCII/forbidden-character or
    /// non-hex-with-nesting rules.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Local I/O failure; retryable at the caller's discretion.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for transport failures (network, protocol); retryable
    /// at the caller's discretion.
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Returns true if retrying the failed operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Backend(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(Error::Backend("connection reset".into()).is_retryable());
        assert!(!Error::ObjectNotFound("data/00".into()).is_retryable());
        assert!(!Error::BackendMustBeOpen.is_retryable());
    }
}
