//! Per-diff change production.
//!
//! A [`Differ`] compares one (lower, upper) snapshot pair and feeds the
//! resulting change stream to the applier. Two strategies exist: reading a
//! visible overlay upperdir directly, or double-walking both trees. Either
//! way, source paths are resolved down to the backing filesystem so that
//! hardlink attempts in the applier stay on one device.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::{SnapshotError, SnapshotResult};
use crate::mount::{overlay_layers, upperdir_of, Mount};
use crate::overlay;
use crate::walk::{self, ChangeKind};

/// Stat snapshot of a change source, captured with `lstat` semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeStat {
    /// Full mode including the file type bits.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Device number for device nodes.
    pub rdev: u64,
    /// Size in bytes.
    pub size: i64,
    /// Hardlink count.
    pub nlink: u64,
    /// Inode number.
    pub ino: u64,
    /// Device of the containing filesystem.
    pub dev: u64,
    /// Access time seconds.
    pub atime: i64,
    /// Access time nanoseconds.
    pub atime_nsec: i64,
    /// Modification time seconds.
    pub mtime: i64,
    /// Modification time nanoseconds.
    pub mtime_nsec: i64,
}

impl ChangeStat {
    /// Captures a stat snapshot from filesystem metadata.
    pub fn from_metadata(meta: &fs::Metadata) -> ChangeStat {
        ChangeStat {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size() as i64,
            nlink: meta.nlink(),
            ino: meta.ino(),
            dev: meta.dev(),
            atime: meta.atime(),
            atime_nsec: meta.atime_nsec(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        }
    }

    /// Synthesizes the stat of a char(0,0) whiteout device.
    pub fn whiteout() -> ChangeStat {
        ChangeStat {
            mode: libc::S_IFCHR as u32,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            nlink: 1,
            ino: 0,
            dev: 0,
            atime: 0,
            atime_nsec: 0,
            mtime: 0,
            mtime_nsec: 0,
        }
    }

    /// File type bits of the mode.
    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT as u32
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR as u32
    }

    /// The `(dev, ino)` identity used for hardlink bookkeeping.
    pub fn inode(&self) -> (u64, u64) {
        (self.dev, self.ino)
    }
}

/// One change emitted by the differ.
#[derive(Debug, Clone)]
pub struct Change {
    /// The kind of change.
    pub kind: ChangeKind,
    /// Subpath relative to the snapshot root, e.g. `/etc/hosts`.
    pub subpath: PathBuf,
    /// Backing file to copy or link from; absent for deletions.
    pub srcpath: Option<PathBuf>,
    /// Stat of the source; absent for deletions.
    pub stat: Option<ChangeStat>,
    /// Subpath of an earlier change in the same diff that hardlinks to this
    /// one, if any.
    pub link_subpath: Option<PathBuf>,
}

/// Computes the change stream for one (lower, upper) snapshot pair.
pub struct Differ {
    lower_root: Option<PathBuf>,
    /// Lower content layers ordered highest to lowest.
    lower_layers: Vec<PathBuf>,
    upper_root: Option<PathBuf>,
    upper_bind_source: Option<PathBuf>,
    /// Upper overlay layers ordered highest to lowest.
    upper_layers: Vec<PathBuf>,
    /// Set when the overlay upperdir shortcut applies.
    upperdir: Option<PathBuf>,
    visited: HashSet<PathBuf>,
    inodes: HashMap<(u64, u64), PathBuf>,
}

impl Differ {
    /// Builds a differ for the given mount lists. `lower` of `None` diffs
    /// against the empty tree.
    pub fn new(lower: Option<&[Mount]>, upper: &[Mount]) -> SnapshotResult<Differ> {
        let mut d = Differ {
            lower_root: None,
            lower_layers: Vec::new(),
            upper_root: None,
            upper_bind_source: None,
            upper_layers: Vec::new(),
            upperdir: None,
            visited: HashSet::new(),
            inodes: HashMap::new(),
        };

        if let Some(lower) = lower {
            if lower.len() != 1 {
                return Err(SnapshotError::InvalidMount {
                    reason: format!("expected one lower mount, got {}", lower.len()),
                });
            }
            let m = &lower[0];
            if m.is_bind() {
                let root = fs::canonicalize(&m.source)?;
                d.lower_layers = vec![root.clone()];
                d.lower_root = Some(root);
            } else if m.is_overlay() {
                let mut layers = overlay_layers(m);
                layers.reverse();
                d.lower_layers = layers;
            } else {
                return Err(SnapshotError::UnsupportedMount { mount_type: m.mount_type.clone() });
            }
        }

        if upper.len() != 1 {
            return Err(SnapshotError::InvalidMount {
                reason: format!("expected one upper mount, got {}", upper.len()),
            });
        }
        let m = &upper[0];
        if m.is_bind() {
            let root = fs::canonicalize(&m.source)?;
            d.upper_bind_source = Some(root.clone());
            d.upper_root = Some(root);
        } else if m.is_overlay() {
            let mut layers = overlay_layers(m);
            layers.reverse();
            d.upper_layers = layers;
            if let Some(lower) = lower {
                d.upperdir = upperdir_of(lower, upper);
            }
        } else {
            return Err(SnapshotError::UnsupportedMount { mount_type: m.mount_type.clone() });
        }

        if d.upperdir.is_none() && d.upper_root.is_none() {
            // an opaque overlay upper with no visible writable layer would
            // need a kernel mount to walk
            return Err(SnapshotError::UnsupportedMount { mount_type: m.mount_type.clone() });
        }

        Ok(d)
    }

    /// Produces all changes of this diff in apply order.
    pub fn handle_changes(
        &mut self,
        cancel: &CancelToken,
        handle: &mut dyn FnMut(&Change) -> SnapshotResult<()>,
    ) -> SnapshotResult<()> {
        if let Some(upperdir) = self.upperdir.clone() {
            let lower_layers = self.lower_layers.clone();
            overlay::changes(&upperdir, &lower_layers, cancel, &mut |kind, sub, meta| {
                let srcpath = meta.map(|_| join_subpath(&upperdir, sub));
                self.emit(cancel, kind, sub, srcpath, handle)
            })
        } else {
            let upper_root = self.upper_root.clone().ok_or_else(|| {
                SnapshotError::InvalidMount { reason: "upper tree is not walkable".to_string() }
            })?;
            let lower_root = self.lower_root.clone();
            walk::changes(lower_root.as_deref(), &upper_root, cancel, &mut |kind, sub, meta| {
                if kind == ChangeKind::Unmodified {
                    return Ok(());
                }
                let srcpath = match meta {
                    None => None,
                    Some(meta) => Some(self.resolve_srcpath(&upper_root, sub, meta.is_dir())?),
                };
                self.emit(cancel, kind, sub, srcpath, handle)
            })
        }
    }

    fn emit(
        &mut self,
        cancel: &CancelToken,
        kind: ChangeKind,
        subpath: &Path,
        srcpath: Option<PathBuf>,
        handle: &mut dyn FnMut(&Change) -> SnapshotResult<()>,
    ) -> SnapshotResult<()> {
        if kind == ChangeKind::Unmodified {
            return Ok(());
        }

        // Parents are synthesized even for deletions so exporters observe
        // accurate directory metadata along the path.
        self.check_parent(cancel, subpath, handle)?;

        let mut change = Change {
            kind,
            subpath: subpath.to_path_buf(),
            srcpath,
            stat: None,
            link_subpath: None,
        };

        if let Some(src) = &change.srcpath {
            let meta = fs::symlink_metadata(src)?;
            let stat = ChangeStat::from_metadata(&meta);
            if !stat.is_dir() && stat.nlink > 1 {
                match self.inodes.get(&stat.inode()) {
                    Some(first) => change.link_subpath = Some(first.clone()),
                    None => {
                        self.inodes.insert(stat.inode(), change.subpath.clone());
                    }
                }
            }
            change.stat = Some(stat);
        }

        handle(&change)
    }

    fn check_parent(
        &mut self,
        cancel: &CancelToken,
        subpath: &Path,
        handle: &mut dyn FnMut(&Change) -> SnapshotResult<()>,
    ) -> SnapshotResult<()> {
        cancel.check()?;
        let parent = match subpath.parent() {
            Some(p) if p != Path::new("/") => p.to_path_buf(),
            _ => return Ok(()),
        };
        if !self.visited.insert(parent.clone()) {
            return Ok(());
        }
        self.check_parent(cancel, &parent, handle)?;

        let srcpath = self.stat_upper(&parent)?;
        let meta = fs::symlink_metadata(&srcpath)?;
        handle(&Change {
            kind: ChangeKind::Modify,
            subpath: parent,
            srcpath: Some(srcpath.clone()),
            stat: Some(ChangeStat::from_metadata(&meta)),
            link_subpath: None,
        })
    }

    /// Resolves a subpath of the upper tree to its backing file, scanning
    /// overlay layers highest to lowest for non-directories.
    fn resolve_srcpath(
        &self,
        upper_root: &Path,
        subpath: &Path,
        is_dir: bool,
    ) -> SnapshotResult<PathBuf> {
        if !is_dir {
            if let Some(bind) = &self.upper_bind_source {
                return Ok(join_subpath(bind, subpath));
            }
            if !self.upper_layers.is_empty() {
                if let Some(p) = overlay::resolve_in_layers(&self.upper_layers, subpath)? {
                    return Ok(p);
                }
            }
        }
        Ok(join_subpath(upper_root, subpath))
    }

    /// Locates a subpath in the composite upper view.
    fn stat_upper(&self, subpath: &Path) -> SnapshotResult<PathBuf> {
        if let Some(upperdir) = &self.upperdir {
            let p = join_subpath(upperdir, subpath);
            if fs::symlink_metadata(&p).is_ok() {
                return Ok(p);
            }
            if let Some(p) = overlay::resolve_in_layers(&self.lower_layers, subpath)? {
                return Ok(p);
            }
        } else if let Some(root) = &self.upper_root {
            return Ok(join_subpath(root, subpath));
        } else if let Some(p) = overlay::resolve_in_layers(&self.upper_layers, subpath)? {
            return Ok(p);
        }
        Err(SnapshotError::NotFound { key: subpath.to_string_lossy().into_owned() })
    }
}

fn join_subpath(root: &Path, subpath: &Path) -> PathBuf {
    let mut p = root.to_path_buf();
    for comp in subpath.components() {
        if let std::path::Component::Normal(c) = comp {
            p.push(c);
        }
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(lower: Option<&[Mount]>, upper: &[Mount]) -> Vec<(ChangeKind, String)> {
        let mut d = Differ::new(lower, upper).unwrap();
        let mut out = Vec::new();
        d.handle_changes(&CancelToken::new(), &mut |c| {
            out.push((c.kind, c.subpath.to_string_lossy().into_owned()));
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_bind_diff_emits_parent_modify() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        fs::create_dir_all(lower.path().join("a/b")).unwrap();
        // clone the tree so unmodified entries compare equal
        fs_extra_copy(lower.path(), upper.path());
        fs::write(upper.path().join("a/b/new"), b"1").unwrap();

        let got = collect(
            Some(&[Mount::bind(lower.path())]),
            &[Mount::bind(upper.path())],
        );
        assert_eq!(
            got,
            vec![
                (ChangeKind::Modify, "/a".to_string()),
                (ChangeKind::Modify, "/a/b".to_string()),
                (ChangeKind::Add, "/a/b/new".to_string()),
            ]
        );
    }

    // minimal recursive copy preserving times, for fixtures
    fn fs_extra_copy(src: &Path, dst: &Path) {
        for entry in fs::read_dir(src).unwrap() {
            let entry = entry.unwrap();
            let to = dst.join(entry.file_name());
            let meta = entry.metadata().unwrap();
            if meta.is_dir() {
                fs::create_dir(&to).unwrap();
                fs_extra_copy(&entry.path(), &to);
            } else {
                fs::copy(entry.path(), &to).unwrap();
            }
            let meta = fs::symlink_metadata(entry.path()).unwrap();
            crate::sys::set_times_nofollow(
                &to,
                Some((meta.atime(), meta.atime_nsec())),
                Some((meta.mtime(), meta.mtime_nsec())),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_intra_diff_hardlinks_are_replayed() {
        let upper = tempfile::tempdir().unwrap();
        fs::write(upper.path().join("a"), b"x").unwrap();
        fs::hard_link(upper.path().join("a"), upper.path().join("b")).unwrap();

        let mut d = Differ::new(None, &[Mount::bind(upper.path())]).unwrap();
        let mut links = Vec::new();
        d.handle_changes(&CancelToken::new(), &mut |c| {
            links.push((c.subpath.clone(), c.link_subpath.clone()));
            Ok(())
        })
        .unwrap();
        assert_eq!(links[0], (PathBuf::from("/a"), None));
        assert_eq!(links[1], (PathBuf::from("/b"), Some(PathBuf::from("/a"))));
    }

    #[test]
    fn test_overlay_shortcut_is_selected() {
        let base = tempfile::tempdir().unwrap();
        let lowerdir = base.path().join("lower");
        let upperdir = base.path().join("upper");
        let workdir = base.path().join("work");
        fs::create_dir_all(&lowerdir).unwrap();
        fs::create_dir_all(&upperdir).unwrap();
        fs::create_dir_all(&workdir).unwrap();
        fs::write(lowerdir.join("kept"), b"1").unwrap();
        fs::write(upperdir.join("added"), b"2").unwrap();

        let lower = vec![Mount::bind(&lowerdir)];
        let upper = vec![Mount::overlay(&upperdir, &workdir, &[lowerdir.clone()])];
        let got = collect(Some(&lower), &upper);
        assert_eq!(got, vec![(ChangeKind::Add, "/added".to_string())]);
    }
}
