//! Synchronized double-walk over two directory trees.
//!
//! Produces the change stream that transforms the lower tree into the upper
//! tree. Changes are emitted depth-first in subpath-sorted order, which is
//! the order the applier consumes them in.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::SnapshotResult;

/// The kind of difference at a subpath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Present only in the upper tree.
    Add,
    /// Present in both trees with different content or metadata.
    Modify,
    /// Present only in the lower tree.
    Delete,
    /// Present in both trees and identical.
    Unmodified,
}

/// Callback receiving each change: kind, absolute-style subpath (`/a/b`) and
/// the upper entry's metadata (absent for deletions).
pub type ChangeFn<'a> =
    dyn FnMut(ChangeKind, &Path, Option<&fs::Metadata>) -> SnapshotResult<()> + 'a;

/// Walks `lower` and `upper` in lockstep, emitting changes.
///
/// With no lower tree every upper entry is an `Add`.
pub fn changes(
    lower: Option<&Path>,
    upper: &Path,
    cancel: &CancelToken,
    cb: &mut ChangeFn<'_>,
) -> SnapshotResult<()> {
    diff_dirs(lower, Some(upper), Path::new("/"), cancel, cb)
}

fn sorted_entries(dir: &Path) -> std::io::Result<Vec<(std::ffi::OsString, PathBuf)>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .map(|e| e.map(|e| (e.file_name(), e.path())))
        .collect::<Result<_, _>>()?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

fn diff_dirs(
    lower: Option<&Path>,
    upper: Option<&Path>,
    subpath: &Path,
    cancel: &CancelToken,
    cb: &mut ChangeFn<'_>,
) -> SnapshotResult<()> {
    cancel.check()?;

    let lower_entries = match lower {
        Some(dir) => sorted_entries(dir)?,
        None => Vec::new(),
    };
    let upper_entries = match upper {
        Some(dir) => sorted_entries(dir)?,
        None => Vec::new(),
    };

    let (mut i, mut j) = (0, 0);
    while i < lower_entries.len() || j < upper_entries.len() {
        cancel.check()?;
        let order = match (lower_entries.get(i), upper_entries.get(j)) {
            (Some((ln, _)), Some((un, _))) => ln.cmp(un),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => break,
        };
        match order {
            std::cmp::Ordering::Less => {
                // only in lower: deleted
                let (name, _) = &lower_entries[i];
                cb(ChangeKind::Delete, &subpath.join(name), None)?;
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                // only in upper: added
                let (name, path) = &upper_entries[j];
                let sub = subpath.join(name);
                let meta = fs::symlink_metadata(path)?;
                let is_dir = meta.is_dir();
                cb(ChangeKind::Add, &sub, Some(&meta))?;
                if is_dir {
                    diff_dirs(None, Some(path), &sub, cancel, cb)?;
                }
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                let (name, lpath) = &lower_entries[i];
                let (_, upath) = &upper_entries[j];
                let sub = subpath.join(name);
                let lmeta = fs::symlink_metadata(lpath)?;
                let umeta = fs::symlink_metadata(upath)?;
                let both_dirs = lmeta.is_dir() && umeta.is_dir();
                let kind = if same_entry(lpath, &lmeta, upath, &umeta)? {
                    ChangeKind::Unmodified
                } else {
                    ChangeKind::Modify
                };
                cb(kind, &sub, Some(&umeta))?;
                if both_dirs {
                    diff_dirs(Some(lpath), Some(upath), &sub, cancel, cb)?;
                } else if umeta.is_dir() {
                    // type changed to a directory: its contents are all new
                    diff_dirs(None, Some(upath), &sub, cancel, cb)?;
                }
                i += 1;
                j += 1;
            }
        }
    }
    Ok(())
}

/// Compares two directory entries for equality.
///
/// Directories compare by mode and ownership only; sizes and times of
/// directories change whenever children do and are not content.
fn same_entry(
    lpath: &Path,
    lmeta: &fs::Metadata,
    upath: &Path,
    umeta: &fs::Metadata,
) -> std::io::Result<bool> {
    if lmeta.mode() != umeta.mode() || lmeta.uid() != umeta.uid() || lmeta.gid() != umeta.gid() {
        return Ok(false);
    }
    let ft = lmeta.file_type();
    if ft.is_dir() {
        return Ok(true);
    }
    if ft.is_symlink() {
        return Ok(fs::read_link(lpath)? == fs::read_link(upath)?);
    }
    if lmeta.rdev() != umeta.rdev() {
        return Ok(false);
    }
    Ok(lmeta.size() == umeta.size()
        && lmeta.mtime() == umeta.mtime()
        && lmeta.mtime_nsec() == umeta.mtime_nsec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(lower: Option<&Path>, upper: &Path) -> Vec<(ChangeKind, String)> {
        let mut out = Vec::new();
        changes(lower, upper, &CancelToken::new(), &mut |kind, sub, _| {
            if kind != ChangeKind::Unmodified {
                out.push((kind, sub.to_string_lossy().into_owned()));
            }
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_all_adds_without_lower() {
        let upper = tempfile::tempdir().unwrap();
        fs::create_dir(upper.path().join("d")).unwrap();
        fs::write(upper.path().join("d/f"), b"1").unwrap();
        fs::write(upper.path().join("z"), b"2").unwrap();

        let got = collect(None, upper.path());
        assert_eq!(
            got,
            vec![
                (ChangeKind::Add, "/d".to_string()),
                (ChangeKind::Add, "/d/f".to_string()),
                (ChangeKind::Add, "/z".to_string()),
            ]
        );
    }

    #[test]
    fn test_add_modify_delete() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        fs::write(lower.path().join("same"), b"s").unwrap();
        fs::write(lower.path().join("gone"), b"g").unwrap();
        fs::write(lower.path().join("changed"), b"old").unwrap();
        fs::copy(lower.path().join("same"), upper.path().join("same")).unwrap();
        // preserve times so "same" compares equal
        let meta = fs::symlink_metadata(lower.path().join("same")).unwrap();
        crate::sys::set_times_nofollow(
            &upper.path().join("same"),
            Some((meta.atime(), meta.atime_nsec())),
            Some((meta.mtime(), meta.mtime_nsec())),
        )
        .unwrap();
        fs::write(upper.path().join("changed"), b"newer").unwrap();
        fs::write(upper.path().join("added"), b"a").unwrap();

        let got = collect(Some(lower.path()), upper.path());
        assert_eq!(
            got,
            vec![
                (ChangeKind::Add, "/added".to_string()),
                (ChangeKind::Modify, "/changed".to_string()),
                (ChangeKind::Delete, "/gone".to_string()),
            ]
        );
    }

    #[test]
    fn test_type_change_is_modify_with_new_children() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        fs::write(lower.path().join("x"), b"file").unwrap();
        fs::create_dir(upper.path().join("x")).unwrap();
        fs::write(upper.path().join("x/inner"), b"1").unwrap();

        let got = collect(Some(lower.path()), upper.path());
        assert_eq!(
            got,
            vec![
                (ChangeKind::Modify, "/x".to_string()),
                (ChangeKind::Add, "/x/inner".to_string()),
            ]
        );
    }

    #[test]
    fn test_symlink_target_change_detected() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("a", lower.path().join("l")).unwrap();
        std::os::unix::fs::symlink("b", upper.path().join("l")).unwrap();

        let got = collect(Some(lower.path()), upper.path());
        assert_eq!(got, vec![(ChangeKind::Modify, "/l".to_string())]);
    }

    #[test]
    fn test_deleted_directory_is_single_delete() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        fs::create_dir(lower.path().join("d")).unwrap();
        fs::write(lower.path().join("d/f"), b"1").unwrap();

        let got = collect(Some(lower.path()), upper.path());
        assert_eq!(got, vec![(ChangeKind::Delete, "/d".to_string())]);
    }

    #[test]
    fn test_cancel_stops_walk() {
        let upper = tempfile::tempdir().unwrap();
        fs::write(upper.path().join("f"), b"1").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = changes(None, upper.path(), &cancel, &mut |_, _, _| Ok(())).unwrap_err();
        assert!(matches!(err, crate::error::SnapshotError::Cancelled));
    }
}
