//! Error types for the device provisioning core.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while provisioning or observing devices.
#[derive(Debug, Error)]
pub enum Error {
    /// The request is malformed or references something that cannot be served.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Credentials are missing, malformed or rejected.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The caller is authenticated but not allowed to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A named resource does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Resource kind, e.g. `user` or `device`.
        kind: &'static str,
        /// Resource name.
        name: String,
    },

    /// The resource already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A call against the cluster platform failed.
    #[error("platform error: {0}")]
    Platform(String),

    /// A call against the identity backend failed.
    #[error("identity backend error: {0}")]
    Identity(String),

    /// The selected identity backend does not implement the operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The plugin catalog document could not be parsed.
    #[error("failed to parse plugin catalog: {0}")]
    CatalogParse(#[from] serde_json::Error),

    /// The state cache has not completed its initial synchronization.
    #[error("cluster state cache not synced: {0}")]
    NotSynced(String),

    /// Host filesystem error while preparing volumes.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`].
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether this error is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("user", "alice");
        assert_eq!(err.to_string(), "user not found: alice");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_from_serde_error() {
        let serde_err = serde_json::from_str::<i32>("nope").unwrap_err();
        let err = Error::from(serde_err);
        assert!(matches!(err, Error::CatalogParse(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_invalid_request_display() {
        let err = Error::InvalidRequest("sandbox name is empty".to_string());
        assert_eq!(err.to_string(), "invalid request: sandbox name is empty");
    }
}
