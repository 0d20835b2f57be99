//! Error types for the cache core.

use std::sync::Arc;

use thiserror::Error;

use strata_snapshot::{Digest, SnapshotError};

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error variants for cache operations.
///
/// The type is `Clone` (I/O sources are held behind `Arc`) so that
/// single-flight waiters can share a leader's failure.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The record id is absent from both the resident map and metadata.
    #[error("not found: {id}")]
    NotFound {
        /// The missing record id.
        id: String,
    },

    /// A mutable record already has active handles.
    #[error("{id} is locked")]
    Locked {
        /// The locked record id.
        id: String,
    },

    /// A precondition was violated.
    #[error("invalid: {reason}")]
    Invalid {
        /// Description of the violation.
        reason: String,
    },

    /// One or more lazy ancestors lack a descriptor handler. The caller is
    /// expected to install handlers for the listed digests and retry.
    #[error("missing descriptor handlers for {} blob(s)", .0.len())]
    NeedsRemoteProviders(Vec<Digest>),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// An underlying snapshotter, content-store or lease failure.
    #[error("snapshot error: {0}")]
    Snapshot(#[source] Arc<SnapshotError>),

    /// A metadata store failure.
    #[error("metadata error: {reason}")]
    Metadata {
        /// Description of the failure.
        reason: String,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// Several independent failures from one compound operation.
    #[error("multiple errors: {0:?}")]
    Multiple(Vec<CacheError>),
}

impl From<SnapshotError> for CacheError {
    fn from(e: SnapshotError) -> Self {
        match e {
            SnapshotError::Cancelled => CacheError::Cancelled,
            other => CacheError::Snapshot(Arc::new(other)),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(Arc::new(e))
    }
}

impl CacheError {
    /// Returns true for record-not-found errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }

    /// Returns true for locked-record errors.
    pub fn is_locked(&self) -> bool {
        matches!(self, CacheError::Locked { .. })
    }

    /// Returns true when the error asks the caller to install descriptor
    /// handlers.
    pub fn needs_remote_providers(&self) -> bool {
        matches!(self, CacheError::NeedsRemoteProviders(_))
    }

    /// Combines accumulated errors from a compound operation, if any.
    pub fn join(errors: Vec<CacheError>) -> Option<CacheError> {
        match errors.len() {
            0 => None,
            1 => errors.into_iter().next(),
            _ => Some(CacheError::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_cancelled_maps_to_cancelled() {
        let err: CacheError = SnapshotError::Cancelled.into();
        assert!(matches!(err, CacheError::Cancelled));
    }

    #[test]
    fn test_predicates() {
        assert!(CacheError::NotFound { id: "x".into() }.is_not_found());
        assert!(CacheError::Locked { id: "x".into() }.is_locked());
        assert!(CacheError::NeedsRemoteProviders(vec![]).needs_remote_providers());
    }

    #[test]
    fn test_join() {
        assert!(CacheError::join(vec![]).is_none());
        let one = CacheError::join(vec![CacheError::Cancelled]).unwrap();
        assert!(matches!(one, CacheError::Cancelled));
        let many = CacheError::join(vec![
            CacheError::Cancelled,
            CacheError::NotFound { id: "a".into() },
        ])
        .unwrap();
        assert!(matches!(many, CacheError::Multiple(v) if v.len() == 2));
    }

    #[test]
    fn test_errors_are_cloneable() {
        let err: CacheError = std::io::Error::new(std::io::ErrorKind::Other, "x").into();
        let _clone = err.clone();
    }
}
