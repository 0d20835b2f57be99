//! Content store contract.
//!
//! Blobs are compressed byte sequences addressed by digest. The cache core
//! only consumes metadata (`info`/`update`) plus raw reads; ingestion happens
//! through descriptor handlers owned by the caller.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{SnapshotError, SnapshotResult};

/// Annotation key carrying a blob's uncompressed digest.
pub const UNCOMPRESSED_ANNOTATION: &str = "containerd.io/uncompressed";

/// A typed reference to a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Digest of the (compressed) blob bytes.
    pub digest: Digest,
    /// Blob size in bytes.
    pub size: i64,
    /// Media type of the blob.
    pub media_type: String,
    /// Free-form annotations.
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    /// Returns the uncompressed digest recorded in the annotations.
    pub fn uncompressed_digest(&self) -> Option<Digest> {
        self.annotations
            .get(UNCOMPRESSED_ANNOTATION)
            .and_then(|v| Digest::parse(v))
    }
}

/// Stored metadata about a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    /// The blob digest.
    pub digest: Digest,
    /// Blob size in bytes.
    pub size: i64,
    /// Labels attached to the blob.
    pub labels: HashMap<String, String>,
}

/// Contract for blob storage.
pub trait ContentStore: Send + Sync {
    /// Returns metadata for a blob.
    fn info(&self, digest: &Digest) -> SnapshotResult<ContentInfo>;

    /// Updates blob metadata. `fieldpaths` selects fields, e.g. `labels.foo`;
    /// an empty label value removes the label. With no fieldpaths the label
    /// set is replaced wholesale.
    fn update(&self, info: ContentInfo, fieldpaths: &[String]) -> SnapshotResult<ContentInfo>;

    /// Reads the raw bytes of a blob.
    fn read(&self, digest: &Digest) -> SnapshotResult<Vec<u8>>;

    /// Writes a blob, returning its digest.
    fn write(&self, data: Vec<u8>) -> SnapshotResult<Digest>;

    /// Deletes a blob.
    fn delete(&self, digest: &Digest) -> SnapshotResult<()>;
}

/// In-memory content store for tests and embedded deployments.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<Digest, (Vec<u8>, HashMap<String, String>)>>,
}

impl MemoryContentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentStore for MemoryContentStore {
    fn info(&self, digest: &Digest) -> SnapshotResult<ContentInfo> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        let (data, labels) = blobs
            .get(digest)
            .ok_or_else(|| SnapshotError::NotFound { key: digest.to_string() })?;
        Ok(ContentInfo {
            digest: digest.clone(),
            size: data.len() as i64,
            labels: labels.clone(),
        })
    }

    fn update(&self, info: ContentInfo, fieldpaths: &[String]) -> SnapshotResult<ContentInfo> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        let (data, labels) = blobs
            .get_mut(&info.digest)
            .ok_or_else(|| SnapshotError::NotFound { key: info.digest.to_string() })?;
        if fieldpaths.is_empty() {
            *labels = info.labels.clone();
        } else {
            for field in fieldpaths {
                if let Some(label) = field.strip_prefix("labels.") {
                    match info.labels.get(label) {
                        Some(v) if !v.is_empty() => {
                            labels.insert(label.to_string(), v.clone());
                        }
                        _ => {
                            labels.remove(label);
                        }
                    }
                }
            }
        }
        Ok(ContentInfo {
            digest: info.digest,
            size: data.len() as i64,
            labels: labels.clone(),
        })
    }

    fn read(&self, digest: &Digest) -> SnapshotResult<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs
            .get(digest)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| SnapshotError::NotFound { key: digest.to_string() })
    }

    fn write(&self, data: Vec<u8>) -> SnapshotResult<Digest> {
        let digest = Digest::from_bytes(&data);
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.entry(digest.clone()).or_insert((data, HashMap::new()));
        Ok(digest)
    }

    fn delete(&self, digest: &Digest) -> SnapshotResult<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        if blobs.remove(digest).is_none() {
            return Err(SnapshotError::NotFound { key: digest.to_string() });
        }
        Ok(())
    }
}
