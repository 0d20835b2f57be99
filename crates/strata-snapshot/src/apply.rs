//! Unpacking layer blobs onto mounts.
//!
//! The cache core treats blob decoding as an external concern: a
//! [`LayerApplier`] consumes a descriptor plus destination mounts and writes
//! the layer's files. [`MockApplier`] ships an implementation over a JSON
//! entry-list payload for tests and embedded deployments; wire formats and
//! compression live outside this crate.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::applier::safe_join;
use crate::cancel::CancelToken;
use crate::content::{ContentStore, Descriptor};
use crate::error::{SnapshotError, SnapshotResult};
use crate::local::LocalMounter;
use crate::mount::Mount;

/// Unpacks a blob onto a destination mount list.
pub trait LayerApplier: Send + Sync {
    /// Reads the blob named by `desc` and writes its contents onto `mounts`.
    fn apply(&self, cancel: &CancelToken, desc: &Descriptor, mounts: &[Mount])
        -> SnapshotResult<()>;
}

/// The kind of a single layer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerEntryKind {
    /// Regular file with inline content.
    File,
    /// Directory.
    Dir,
    /// Symbolic link.
    Symlink,
    /// Deletion marker for a path from a lower layer.
    Whiteout,
}

/// One entry in a JSON layer payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerEntry {
    /// Path inside the layer, e.g. `/etc/hosts`.
    pub path: String,
    /// Entry kind.
    pub kind: LayerEntryKind,
    /// File content for `File` entries.
    #[serde(default)]
    pub content: String,
    /// Link target for `Symlink` entries.
    #[serde(default)]
    pub target: String,
    /// Permission bits; defaults to 0644 for files and 0755 for directories.
    #[serde(default)]
    pub mode: Option<u32>,
}

impl LayerEntry {
    /// A regular file entry.
    pub fn file(path: &str, content: &str) -> LayerEntry {
        LayerEntry {
            path: path.to_string(),
            kind: LayerEntryKind::File,
            content: content.to_string(),
            target: String::new(),
            mode: None,
        }
    }

    /// A directory entry.
    pub fn dir(path: &str) -> LayerEntry {
        LayerEntry {
            path: path.to_string(),
            kind: LayerEntryKind::Dir,
            content: String::new(),
            target: String::new(),
            mode: None,
        }
    }

    /// A symlink entry.
    pub fn symlink(path: &str, target: &str) -> LayerEntry {
        LayerEntry {
            path: path.to_string(),
            kind: LayerEntryKind::Symlink,
            content: String::new(),
            target: target.to_string(),
            mode: None,
        }
    }

    /// A whiteout entry deleting a lower path.
    pub fn whiteout(path: &str) -> LayerEntry {
        LayerEntry {
            path: path.to_string(),
            kind: LayerEntryKind::Whiteout,
            content: String::new(),
            target: String::new(),
            mode: None,
        }
    }
}

/// Encodes a layer payload.
pub fn encode_layer(entries: &[LayerEntry]) -> Vec<u8> {
    serde_json::to_vec(entries).expect("layer entries serialize")
}

/// Layer applier over JSON entry-list blobs stored in a content store.
pub struct MockApplier {
    content: Arc<dyn ContentStore>,
}

impl MockApplier {
    /// Creates an applier reading blobs from `content`.
    pub fn new(content: Arc<dyn ContentStore>) -> Self {
        Self { content }
    }
}

impl LayerApplier for MockApplier {
    fn apply(
        &self,
        cancel: &CancelToken,
        desc: &Descriptor,
        mounts: &[Mount],
    ) -> SnapshotResult<()> {
        let data = self.content.read(&desc.digest)?;
        let entries: Vec<LayerEntry> =
            serde_json::from_slice(&data).map_err(|e| SnapshotError::InvalidBlob {
                digest: desc.digest.to_string(),
                reason: e.to_string(),
            })?;
        let root = LocalMounter::mount_root(mounts)?;
        debug!(digest = %desc.digest, entries = entries.len(), "applying layer blob");

        for entry in &entries {
            cancel.check()?;
            let dst = safe_join(&root, Path::new(&entry.path))?;
            match entry.kind {
                LayerEntryKind::Dir => {
                    std::fs::create_dir_all(&dst)?;
                    set_mode(&dst, entry.mode.unwrap_or(0o755))?;
                }
                LayerEntryKind::File => {
                    if let Some(parent) = dst.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&dst, entry.content.as_bytes())?;
                    set_mode(&dst, entry.mode.unwrap_or(0o644))?;
                }
                LayerEntryKind::Symlink => {
                    if let Some(parent) = dst.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::os::unix::fs::symlink(&entry.target, &dst)?;
                }
                LayerEntryKind::Whiteout => match std::fs::symlink_metadata(&dst) {
                    Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&dst)?,
                    Ok(_) => std::fs::remove_file(&dst)?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Ok(())
    }
}

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;
    use std::collections::HashMap;

    fn descriptor_for(cs: &MemoryContentStore, entries: &[LayerEntry]) -> Descriptor {
        let data = encode_layer(entries);
        let digest = cs.write(data.clone()).unwrap();
        Descriptor {
            digest,
            size: data.len() as i64,
            media_type: "application/vnd.strata.layer.v1+json".to_string(),
            annotations: HashMap::new(),
        }
    }

    #[test]
    fn test_apply_writes_entries() {
        let cs = Arc::new(MemoryContentStore::new());
        let desc = descriptor_for(
            &cs,
            &[
                LayerEntry::dir("/etc"),
                LayerEntry::file("/etc/hosts", "localhost"),
                LayerEntry::symlink("/etc/alias", "hosts"),
            ],
        );
        let dir = tempfile::tempdir().unwrap();
        let applier = MockApplier::new(cs);
        applier
            .apply(&CancelToken::new(), &desc, &[Mount::bind(dir.path())])
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("etc/hosts")).unwrap(), b"localhost");
        assert_eq!(
            std::fs::read_link(dir.path().join("etc/alias")).unwrap(),
            std::path::PathBuf::from("hosts")
        );
    }

    #[test]
    fn test_whiteout_removes_existing_path() {
        let cs = Arc::new(MemoryContentStore::new());
        let desc = descriptor_for(&cs, &[LayerEntry::whiteout("/gone")]);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone"), b"1").unwrap();

        MockApplier::new(cs)
            .apply(&CancelToken::new(), &desc, &[Mount::bind(dir.path())])
            .unwrap();
        assert!(!dir.path().join("gone").exists());
    }

    #[test]
    fn test_corrupt_blob_is_rejected() {
        let cs = Arc::new(MemoryContentStore::new());
        let digest = cs.write(b"not json".to_vec()).unwrap();
        let desc = Descriptor {
            digest,
            size: 8,
            media_type: "application/octet-stream".to_string(),
            annotations: HashMap::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let err = MockApplier::new(cs)
            .apply(&CancelToken::new(), &desc, &[Mount::bind(dir.path())])
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidBlob { .. }));
    }

    #[test]
    fn test_cancelled_apply_stops() {
        let cs = Arc::new(MemoryContentStore::new());
        let desc = descriptor_for(&cs, &[LayerEntry::file("/f", "1")]);
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = MockApplier::new(cs)
            .apply(&cancel, &desc, &[Mount::bind(dir.path())])
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Cancelled));
    }
}
