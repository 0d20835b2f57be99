//! Descriptor handlers: per-digest hooks for materializing remote blobs.

use std::collections::HashMap;
use std::sync::Arc;

use strata_snapshot::{CancelToken, Descriptor, Digest};

use crate::error::CacheResult;

/// Materializes a blob's bytes into the content store on demand.
pub trait BlobProvider: Send + Sync {
    /// Fetches the blob named by `desc` and writes it to the content store.
    /// Called at most once per digest at a time; callers coalesce.
    fn fetch(&self, cancel: &CancelToken, desc: &Descriptor) -> CacheResult<()>;
}

/// Progress hooks for a blob fetch. All methods default to no-ops.
pub trait Progress: Send + Sync {
    /// Called when work on a descriptor begins.
    fn started(&self, _desc: &Descriptor) {}

    /// Called with a status message while work proceeds.
    fn status(&self, _desc: &Descriptor, _message: &str) {}

    /// Called when work finishes; `ok` reports the outcome.
    fn finished(&self, _desc: &Descriptor, _ok: bool) {}
}

/// External contributor supplied per lazy digest.
#[derive(Clone)]
pub struct DescHandler {
    /// Provider that materializes the blob bytes.
    pub provider: Arc<dyn BlobProvider>,
    /// Labels hinting remote-capable snapshotters.
    pub snapshot_labels: HashMap<String, String>,
    /// Blob annotations not persisted in the content store.
    pub annotations: HashMap<String, String>,
    /// Optional progress reporting.
    pub progress: Option<Arc<dyn Progress>>,
}

impl DescHandler {
    /// Creates a handler from a provider, with no labels or progress.
    pub fn new(provider: Arc<dyn BlobProvider>) -> Self {
        Self {
            provider,
            snapshot_labels: HashMap::new(),
            annotations: HashMap::new(),
            progress: None,
        }
    }
}

/// Handler map keyed by blob digest. Inherited through parent lookups.
pub type DescHandlers = HashMap<Digest, Arc<DescHandler>>;

/// Merges `extra` into `base`, later entries winning.
pub fn merge_handlers(base: &DescHandlers, extra: &DescHandlers) -> DescHandlers {
    let mut out = base.clone();
    for (k, v) in extra {
        out.insert(k.clone(), v.clone());
    }
    out
}
