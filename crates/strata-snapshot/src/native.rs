//! Directory-backed snapshotter producing bind mounts.
//!
//! Each snapshot is a plain directory under the snapshotter root. `prepare`
//! clones the parent's committed tree into a new active directory, `commit`
//! renames the active directory to its committed name, and `view`
//! materializes a read-only clone. Because all snapshots live on one
//! filesystem, cross-snapshot hardlinking in the merge applier works.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{SnapshotError, SnapshotResult};
use crate::mount::Mount;
use crate::snapshotter::{Kind, SnapshotInfo, Snapshotter, Usage};
use crate::sys;

/// A snapshotter storing every snapshot as a directory tree.
pub struct NativeSnapshotter {
    root: PathBuf,
    name: String,
}

impl NativeSnapshotter {
    /// Creates a snapshotter rooted at `root`, creating the directory layout
    /// if needed.
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> SnapshotResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("snapshots"))?;
        Ok(Self { root, name: name.into() })
    }

    fn snapshot_dir(&self, key: &str) -> PathBuf {
        self.root.join("snapshots").join(key)
    }

    fn fs_dir(&self, key: &str) -> PathBuf {
        self.snapshot_dir(key).join("fs")
    }

    fn info_path(&self, key: &str) -> PathBuf {
        self.snapshot_dir(key).join("info.json")
    }

    fn load_info(&self, key: &str) -> SnapshotResult<SnapshotInfo> {
        let data = match fs::read(self.info_path(key)) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound { key: key.to_string() })
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| SnapshotError::InvalidMount {
            reason: format!("corrupt snapshot info for {}: {}", key, e),
        })
    }

    fn store_info(&self, info: &SnapshotInfo) -> SnapshotResult<()> {
        let data = serde_json::to_vec_pretty(info).map_err(|e| SnapshotError::InvalidMount {
            reason: format!("failed to encode snapshot info: {}", e),
        })?;
        fs::write(self.info_path(&info.name), data)?;
        Ok(())
    }

    fn create(
        &self,
        key: &str,
        parent: &str,
        kind: Kind,
        labels: HashMap<String, String>,
    ) -> SnapshotResult<Vec<Mount>> {
        match fs::create_dir(self.snapshot_dir(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SnapshotError::AlreadyExists { key: key.to_string() })
            }
            Err(e) => return Err(e.into()),
        }

        if !parent.is_empty() {
            let pinfo = self.load_info(parent).map_err(|e| {
                let _ = fs::remove_dir_all(self.snapshot_dir(key));
                e
            })?;
            if pinfo.kind != Kind::Committed {
                let _ = fs::remove_dir_all(self.snapshot_dir(key));
                return Err(SnapshotError::InvalidMount {
                    reason: format!("parent {} is not committed", parent),
                });
            }
        }

        // Views of committed content share the parent's tree read-only;
        // active snapshots get a writable clone.
        if kind == Kind::Active || parent.is_empty() {
            fs::create_dir(self.fs_dir(key))?;
            if !parent.is_empty() {
                if let Err(e) = copy_tree(&self.fs_dir(parent), &self.fs_dir(key)) {
                    let _ = fs::remove_dir_all(self.snapshot_dir(key));
                    return Err(e.into());
                }
            }
        }

        let info = SnapshotInfo {
            name: key.to_string(),
            parent: if parent.is_empty() { None } else { Some(parent.to_string()) },
            kind,
            labels,
        };
        self.store_info(&info)?;
        debug!(key = %key, parent = %parent, kind = ?kind, "created snapshot");
        self.mounts_for(&info)
    }

    fn effective_fs_dir(&self, info: &SnapshotInfo) -> PathBuf {
        match (&info.kind, &info.parent) {
            (Kind::View, Some(parent)) => self.fs_dir(parent),
            _ => self.fs_dir(&info.name),
        }
    }

    fn mounts_for(&self, info: &SnapshotInfo) -> SnapshotResult<Vec<Mount>> {
        let mut m = Mount::bind(self.effective_fs_dir(info));
        if info.kind != Kind::Active {
            m.options = vec!["rbind".to_string(), "ro".to_string()];
        }
        Ok(vec![m])
    }
}

impl Snapshotter for NativeSnapshotter {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(
        &self,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> SnapshotResult<Vec<Mount>> {
        self.create(key, parent, Kind::Active, labels)
    }

    fn view(&self, key: &str, parent: &str) -> SnapshotResult<Vec<Mount>> {
        self.create(key, parent, Kind::View, HashMap::new())
    }

    fn mounts(&self, key: &str) -> SnapshotResult<Vec<Mount>> {
        let info = self.load_info(key)?;
        self.mounts_for(&info)
    }

    fn commit(&self, name: &str, key: &str) -> SnapshotResult<()> {
        let mut info = self.load_info(key)?;
        if info.kind != Kind::Active {
            return Err(SnapshotError::InvalidMount {
                reason: format!("commit of non-active snapshot {}", key),
            });
        }
        if self.snapshot_dir(name).exists() {
            return Err(SnapshotError::AlreadyExists { key: name.to_string() });
        }
        fs::rename(self.snapshot_dir(key), self.snapshot_dir(name))?;
        info.name = name.to_string();
        info.kind = Kind::Committed;
        self.store_info(&info)?;
        debug!(name = %name, key = %key, "committed snapshot");
        Ok(())
    }

    fn stat(&self, key: &str) -> SnapshotResult<SnapshotInfo> {
        self.load_info(key)
    }

    fn update(&self, info: SnapshotInfo, fieldpaths: &[String]) -> SnapshotResult<SnapshotInfo> {
        let mut cur = self.load_info(&info.name)?;
        if fieldpaths.is_empty() {
            cur.labels = info.labels;
        } else {
            for field in fieldpaths {
                if let Some(label) = field.strip_prefix("labels.") {
                    match info.labels.get(label) {
                        Some(v) if !v.is_empty() => {
                            cur.labels.insert(label.to_string(), v.clone());
                        }
                        _ => {
                            cur.labels.remove(label);
                        }
                    }
                }
            }
        }
        self.store_info(&cur)?;
        Ok(cur)
    }

    fn usage(&self, key: &str) -> SnapshotResult<Usage> {
        let info = self.load_info(key)?;
        let mut usage = Usage::default();
        let mut inodes = std::collections::HashSet::new();
        walk_usage(&self.effective_fs_dir(&info), &mut usage, &mut inodes)?;
        Ok(usage)
    }

    fn remove(&self, key: &str) -> SnapshotResult<()> {
        let dir = self.snapshot_dir(key);
        if !dir.exists() {
            return Err(SnapshotError::NotFound { key: key.to_string() });
        }
        fs::remove_dir_all(dir)?;
        debug!(key = %key, "removed snapshot");
        Ok(())
    }
}

fn walk_usage(
    path: &Path,
    usage: &mut Usage,
    inodes: &mut std::collections::HashSet<(u64, u64)>,
) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if inodes.insert((meta.dev(), meta.ino())) {
        usage.inodes += 1;
        usage.size += meta.blocks() as i64 * 512;
    }
    if meta.is_dir() {
        let mut entries: Vec<_> = fs::read_dir(path)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            walk_usage(&entry.path(), usage, inodes)?;
        }
    }
    Ok(())
}

/// Recursively clones a directory tree, preserving file types, permissions,
/// ownership, timestamps and xattrs.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(src)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)?;
        let ft = meta.file_type();
        if ft.is_dir() {
            fs::create_dir(&to)?;
            copy_tree(&from, &to)?;
        } else if ft.is_file() {
            fs::copy(&from, &to)?;
        } else if ft.is_symlink() {
            let target = fs::read_link(&from)?;
            std::os::unix::fs::symlink(&target, &to)?;
        } else if ft.is_char_device() || ft.is_block_device() || ft.is_fifo() {
            sys::mknod(&to, meta.mode(), meta.rdev())?;
        } else {
            continue;
        }
        copy_attrs(&from, &to, &meta)?;
    }
    // Directory times last so child creation does not disturb them.
    let meta = fs::symlink_metadata(src)?;
    sys::set_times_nofollow(
        dst,
        Some((meta.atime(), meta.atime_nsec())),
        Some((meta.mtime(), meta.mtime_nsec())),
    )?;
    Ok(())
}

fn copy_attrs(from: &Path, to: &Path, meta: &fs::Metadata) -> std::io::Result<()> {
    for name in sys::llistxattr(from)? {
        if let Some(value) = sys::lgetxattr(from, &name)? {
            if let Err(e) = sys::lsetxattr(to, &name, &value) {
                debug!(path = %to.display(), xattr = %name, error = %e, "failed to copy xattr");
            }
        }
    }
    sys::lchown(to, meta.uid(), meta.gid())?;
    if !meta.file_type().is_symlink() {
        sys::chmod(to, meta.mode())?;
    }
    sys::set_times_nofollow(
        to,
        Some((meta.atime(), meta.atime_nsec())),
        Some((meta.mtime(), meta.mtime_nsec())),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshotter() -> (tempfile::TempDir, NativeSnapshotter) {
        let dir = tempfile::tempdir().unwrap();
        let sn = NativeSnapshotter::new(dir.path(), "native").unwrap();
        (dir, sn)
    }

    fn root_of(mounts: &[Mount]) -> PathBuf {
        mounts[0].source.clone()
    }

    #[test]
    fn test_prepare_commit_lifecycle() {
        let (_dir, sn) = snapshotter();
        let mounts = sn.prepare("a-active", "", HashMap::new()).unwrap();
        fs::write(root_of(&mounts).join("hello"), b"world").unwrap();
        sn.commit("a", "a-active").unwrap();

        let info = sn.stat("a").unwrap();
        assert_eq!(info.kind, Kind::Committed);
        assert!(sn.stat("a-active").is_err());

        let child = sn.prepare("b-active", "a", HashMap::new()).unwrap();
        assert_eq!(fs::read(root_of(&child).join("hello")).unwrap(), b"world");
    }

    #[test]
    fn test_prepare_duplicate_key_fails() {
        let (_dir, sn) = snapshotter();
        sn.prepare("a", "", HashMap::new()).unwrap();
        let err = sn.prepare("a", "", HashMap::new()).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_prepare_missing_parent_fails() {
        let (_dir, sn) = snapshotter();
        let err = sn.prepare("a", "missing", HashMap::new()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_view_exposes_parent_content_readonly() {
        let (_dir, sn) = snapshotter();
        let m = sn.prepare("a-active", "", HashMap::new()).unwrap();
        fs::write(root_of(&m).join("f"), b"1").unwrap();
        sn.commit("a", "a-active").unwrap();

        let vm = sn.view("a-view", "a").unwrap();
        assert!(vm[0].options.contains(&"ro".to_string()));
        assert_eq!(fs::read(root_of(&vm).join("f")).unwrap(), b"1");
    }

    #[test]
    fn test_usage_counts_blocks_and_inodes() {
        let (_dir, sn) = snapshotter();
        let m = sn.prepare("a", "", HashMap::new()).unwrap();
        fs::write(root_of(&m).join("f"), vec![7u8; 8192]).unwrap();
        let usage = sn.usage("a").unwrap();
        assert!(usage.inodes >= 2);
        assert!(usage.size >= 8192);
    }

    #[test]
    fn test_update_labels() {
        let (_dir, sn) = snapshotter();
        sn.prepare("a", "", HashMap::new()).unwrap();
        let mut info = sn.stat("a").unwrap();
        info.labels.insert("k".to_string(), "v".to_string());
        let info = sn.update(info, &["labels.k".to_string()]).unwrap();
        assert_eq!(info.labels.get("k").map(String::as_str), Some("v"));

        let mut info = sn.stat("a").unwrap();
        info.labels.insert("k".to_string(), String::new());
        let info = sn.update(info, &["labels.k".to_string()]).unwrap();
        assert!(!info.labels.contains_key("k"));
    }

    #[test]
    fn test_remove_deletes_state() {
        let (_dir, sn) = snapshotter();
        sn.prepare("a", "", HashMap::new()).unwrap();
        sn.remove("a").unwrap();
        assert!(sn.stat("a").is_err());
        assert!(sn.remove("a").is_err());
    }
}
