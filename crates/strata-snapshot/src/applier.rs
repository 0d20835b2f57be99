//! Applying a change stream onto a destination mount.
//!
//! The applier mutates the destination in the differ's emission order:
//! deletions first (translated to whiteouts on overlay destinations), then a
//! hardlink attempt for link-eligible files, then a copy by file type.
//! Directory mtimes are deferred to [`Applier::flush`] because writing
//! children would reset them.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::differ::{Change, ChangeStat};
use crate::error::{SnapshotError, SnapshotResult};
use crate::mount::Mount;
use crate::overlay;
use crate::snapshotter::Usage;
use crate::sys;
use crate::walk::ChangeKind;

/// Applies changes to a destination mount.
pub struct Applier {
    root: PathBuf,
    /// Destination overlay lower layers, ordered highest to lowest.
    lowerdirs: Vec<PathBuf>,
    create_whiteout_delete: bool,
    cross_snapshot_links: Option<HashSet<(u64, u64)>>,
    dir_mod_times: HashMap<PathBuf, (i64, i64)>,
}

impl Applier {
    /// Builds an applier for a destination mount list.
    ///
    /// Overlay destinations write into their `upperdir` and create explicit
    /// char(0,0) whiteouts for deletions that shadow lower content. Bind
    /// destinations write into the source directory. `try_cross_snapshot_link`
    /// enables hardlinking file content straight from source snapshots.
    pub fn for_mounts(dest: &[Mount], try_cross_snapshot_link: bool) -> SnapshotResult<Applier> {
        if dest.len() != 1 {
            return Err(SnapshotError::InvalidMount {
                reason: format!("expected exactly one dest mount, got {}", dest.len()),
            });
        }
        let m = &dest[0];
        let (root, lowerdirs, whiteouts) = if m.is_overlay() {
            let root = m.upperdir().ok_or_else(|| SnapshotError::InvalidMount {
                reason: format!("could not find upperdir in mount options {:?}", m.options),
            })?;
            let lowerdirs = m.lowerdirs();
            if lowerdirs.is_empty() {
                return Err(SnapshotError::InvalidMount {
                    reason: format!("could not find lowerdir in mount options {:?}", m.options),
                });
            }
            (root, lowerdirs, true)
        } else if m.is_bind() {
            (m.source.clone(), Vec::new(), false)
        } else {
            return Err(SnapshotError::UnsupportedMount { mount_type: m.mount_type.clone() });
        };

        Ok(Applier {
            root: fs::canonicalize(&root)?,
            lowerdirs,
            create_whiteout_delete: whiteouts,
            cross_snapshot_links: try_cross_snapshot_link.then(HashSet::new),
            dir_mod_times: HashMap::new(),
        })
    }

    /// Applies one change.
    pub fn apply(&mut self, cancel: &CancelToken, change: &Change) -> SnapshotResult<()> {
        cancel.check()?;
        if change.kind == ChangeKind::Unmodified {
            return Ok(());
        }

        let dstpath = safe_join(&self.root, &change.subpath)?;
        let mut dst_meta = match fs::symlink_metadata(&dstpath) {
            Ok(m) => Some(m),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut srcpath = change.srcpath.clone();
        let mut stat = change.stat.clone();

        // delete phase
        let delete_only = change.kind == ChangeKind::Delete;
        let overwrite = !delete_only
            && dst_meta.is_some()
            && match (&stat, &dst_meta) {
                (Some(s), Some(d)) => !(s.is_dir() && d.is_dir()),
                _ => false,
            };
        if delete_only || overwrite {
            if let Some(meta) = dst_meta.take() {
                remove_all(&dstpath, &meta)?;
            }
            if delete_only {
                if self.create_whiteout_delete
                    && overlay::exists_in_layers(&self.lowerdirs, &change.subpath)?
                {
                    // the deletion shadows lower content: materialize it as
                    // an explicit whiteout device
                    if stat.is_none() {
                        stat = Some(ChangeStat::whiteout());
                        srcpath = None;
                    }
                } else {
                    return Ok(());
                }
            }
        }

        let stat = stat.ok_or_else(|| SnapshotError::InvalidMount {
            reason: format!("change for {} carries no stat", change.subpath.display()),
        })?;

        // hardlink phase
        if self.apply_hardlink(change, &stat, &dstpath)? {
            return Ok(());
        }

        // copy phase
        self.apply_copy(&stat, srcpath.as_deref(), &dstpath, dst_meta.is_some())
    }

    fn apply_hardlink(
        &mut self,
        change: &Change,
        stat: &ChangeStat,
        dstpath: &Path,
    ) -> SnapshotResult<bool> {
        match stat.file_type() as libc::mode_t {
            libc::S_IFDIR | libc::S_IFIFO | libc::S_IFSOCK => {
                // directories cannot be hardlinked; pipes and sockets are
                // excluded to avoid accidental IPC channels between snapshots
                return Ok(false);
            }
            _ => {}
        }

        let link_src = if let Some(link_subpath) = &change.link_subpath {
            Some(safe_join(&self.root, link_subpath)?)
        } else if self.cross_snapshot_links.is_some() {
            match &change.srcpath {
                Some(src) => {
                    if let Some(links) = self.cross_snapshot_links.as_mut() {
                        links.insert(stat.inode());
                    }
                    Some(src.clone())
                }
                None => None,
            }
        } else {
            None
        };

        let link_src = match link_src {
            Some(p) => p,
            None => return Ok(false),
        };

        match fs::hard_link(&link_src, dstpath) {
            Ok(()) => Ok(true),
            Err(e)
                if e.raw_os_error() == Some(libc::EXDEV)
                    || e.raw_os_error() == Some(libc::EMLINK) =>
            {
                debug!(src = %link_src.display(), dst = %dstpath.display(), error = %e, "hardlink failed, copying");
                if let Some(links) = self.cross_snapshot_links.as_mut() {
                    links.remove(&stat.inode());
                }
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn apply_copy(
        &mut self,
        stat: &ChangeStat,
        srcpath: Option<&Path>,
        dstpath: &Path,
        dst_exists: bool,
    ) -> SnapshotResult<()> {
        match stat.file_type() as libc::mode_t {
            libc::S_IFREG => {
                let src = srcpath.ok_or_else(|| SnapshotError::InvalidMount {
                    reason: "regular file change carries no source".to_string(),
                })?;
                fs::copy(src, dstpath)?;
            }
            libc::S_IFDIR => {
                if !dst_exists {
                    fs::create_dir(dstpath)?;
                }
            }
            libc::S_IFLNK => {
                let src = srcpath.ok_or_else(|| SnapshotError::InvalidMount {
                    reason: "symlink change carries no source".to_string(),
                })?;
                let target = fs::read_link(src)?;
                std::os::unix::fs::symlink(&target, dstpath)?;
            }
            libc::S_IFBLK | libc::S_IFCHR | libc::S_IFIFO | libc::S_IFSOCK => {
                sys::mknod(dstpath, stat.mode, stat.rdev)?;
            }
            other => {
                return Err(SnapshotError::InvalidMount {
                    reason: format!("unhandled file type {:o} at {}", other, dstpath.display()),
                });
            }
        }

        if let Some(src) = srcpath {
            for name in sys::llistxattr(src)? {
                if overlay::is_opaque_xattr(&name) {
                    // opaque markers were already rewritten to explicit
                    // whiteouts by the differ
                    continue;
                }
                if let Some(value) = sys::lgetxattr(src, &name)? {
                    if let Err(e) = sys::lsetxattr(dstpath, &name, &value) {
                        debug!(path = %dstpath.display(), xattr = %name, error = %e, "failed to set xattr");
                    }
                }
            }
        }

        sys::lchown(dstpath, stat.uid, stat.gid)?;
        if stat.file_type() as libc::mode_t != libc::S_IFLNK {
            sys::chmod(dstpath, stat.mode)?;
        }

        if !stat.is_dir() {
            sys::set_times_nofollow(
                dstpath,
                Some((stat.atime, stat.atime_nsec)),
                Some((stat.mtime, stat.mtime_nsec)),
            )?;
        } else {
            self.dir_mod_times
                .insert(dstpath.to_path_buf(), (stat.mtime, stat.mtime_nsec));
        }
        Ok(())
    }

    /// Applies the deferred directory mtimes.
    ///
    /// Walks the destination so a path that was deleted or changed type
    /// since its time was recorded is skipped.
    pub fn flush(&mut self) -> SnapshotResult<()> {
        let times = std::mem::take(&mut self.dir_mod_times);
        flush_dir(&self.root, &times)?;
        Ok(())
    }

    /// Computes the disk usage of the applied destination, counting each
    /// inode once and excluding content hardlinked in from other snapshots.
    pub fn usage(&self) -> SnapshotResult<Usage> {
        let mut usage = Usage::default();
        let mut seen = HashSet::new();
        usage_walk(&self.root, self.cross_snapshot_links.as_ref(), &mut seen, &mut usage)?;
        Ok(usage)
    }
}

fn flush_dir(dir: &Path, times: &HashMap<PathBuf, (i64, i64)>) -> std::io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    entries.sort();
    for path in entries {
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            flush_dir(&path, times)?;
            if let Some((sec, nsec)) = times.get(&path) {
                sys::set_times_nofollow(&path, None, Some((*sec, *nsec)))?;
            }
        }
    }
    Ok(())
}

fn usage_walk(
    path: &Path,
    excluded: Option<&HashSet<(u64, u64)>>,
    seen: &mut HashSet<(u64, u64)>,
    usage: &mut Usage,
) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let inode = (meta.dev(), meta.ino());
    if seen.insert(inode) && !excluded.is_some_and(|ex| ex.contains(&inode)) {
        usage.inodes += 1;
        usage.size += meta.blocks() as i64 * 512;
    }
    if meta.is_dir() {
        let mut entries: Vec<_> = fs::read_dir(path)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        entries.sort();
        for entry in entries {
            usage_walk(&entry, excluded, seen, usage)?;
        }
    }
    Ok(())
}

fn remove_all(path: &Path, meta: &fs::Metadata) -> std::io::Result<()> {
    let res = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Joins a subpath onto a root, rejecting any traversal outside the root.
pub fn safe_join(root: &Path, subpath: &Path) -> SnapshotResult<PathBuf> {
    let mut p = root.to_path_buf();
    for comp in subpath.components() {
        match comp {
            std::path::Component::Normal(c) => p.push(c),
            std::path::Component::RootDir | std::path::Component::CurDir => {}
            _ => {
                return Err(SnapshotError::PathEscape {
                    path: subpath.to_string_lossy().into_owned(),
                })
            }
        }
    }
    Ok(p)
}
