//! Error types for the snapshot subsystem.

use thiserror::Error;

/// Result type alias for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Error variants for snapshotter, content store, lease and diff/apply operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The requested snapshot, blob or lease does not exist.
    #[error("not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A snapshot, blob or lease with this key already exists.
    #[error("already exists: {key}")]
    AlreadyExists {
        /// The key that already exists.
        key: String,
    },

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A mount list could not be interpreted.
    #[error("invalid mount: {reason}")]
    InvalidMount {
        /// Description of the problem.
        reason: String,
    },

    /// The mount type cannot be resolved to a local directory on this backend.
    #[error("unsupported mount type {mount_type:?} on this backend")]
    UnsupportedMount {
        /// The mount type that was rejected.
        mount_type: String,
    },

    /// A blob could not be decoded or verified.
    #[error("invalid blob {digest}: {reason}")]
    InvalidBlob {
        /// Digest of the offending blob.
        digest: String,
        /// Description of the problem.
        reason: String,
    },

    /// A subpath attempted to escape its root directory.
    #[error("path escapes root: {path}")]
    PathEscape {
        /// The offending subpath.
        path: String,
    },
}

impl SnapshotError {
    /// Returns true if this error is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::NotFound { .. })
    }

    /// Returns true if this error is an already-exists error.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, SnapshotError::AlreadyExists { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        let err = SnapshotError::NotFound { key: "sn1".to_string() };
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
    }

    #[test]
    fn test_already_exists_predicate() {
        let err = SnapshotError::AlreadyExists { key: "sn1".to_string() };
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_io_error_wrapping() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: SnapshotError = io.into();
        assert!(matches!(err, SnapshotError::Io(_)));
    }
}
