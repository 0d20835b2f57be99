//! Resolving mount lists to local directories.

use std::path::PathBuf;

use crate::error::{SnapshotError, SnapshotResult};
use crate::mount::Mount;

/// Resolves a mount list to an on-disk root directory without performing a
/// kernel mount.
///
/// Bind mounts resolve to their source directory. Overlay mounts cannot be
/// resolved to a single directory without kernel support and are rejected;
/// callers handle them through their `upperdir`/`lowerdir` options instead.
pub struct LocalMounter;

impl LocalMounter {
    /// Returns the root directory behind a single-entry mount list.
    pub fn mount_root(mounts: &[Mount]) -> SnapshotResult<PathBuf> {
        if mounts.len() != 1 {
            return Err(SnapshotError::InvalidMount {
                reason: format!("expected exactly one mount, got {}", mounts.len()),
            });
        }
        let m = &mounts[0];
        if m.is_bind() {
            let root = std::fs::canonicalize(&m.source)?;
            return Ok(root);
        }
        Err(SnapshotError::UnsupportedMount {
            mount_type: m.mount_type.clone(),
        })
    }
}
