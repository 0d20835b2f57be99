//! Change enumeration from a visible overlay upperdir.
//!
//! When the upper snapshot is an overlay whose writable layer sits directly
//! on the lower snapshot's layers, the change stream can be read from the
//! upperdir alone: overlayfs records deletions as char(0,0) whiteout devices
//! and replaced directories via the opaque xattr.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::SnapshotResult;
use crate::walk::{ChangeFn, ChangeKind};

const OPAQUE_XATTRS: [&str; 2] = ["trusted.overlay.opaque", "user.overlay.opaque"];

/// Returns true for xattr names encoding overlay opaque markers.
pub fn is_opaque_xattr(name: &str) -> bool {
    OPAQUE_XATTRS.contains(&name)
}

fn is_whiteout(meta: &fs::Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

fn is_opaque_dir(path: &Path) -> std::io::Result<bool> {
    for name in OPAQUE_XATTRS {
        if let Some(v) = crate::sys::lgetxattr(path, name)? {
            if v == b"y" {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Returns true when `subpath` exists in any of the lower layers
/// (ordered highest to lowest).
pub fn exists_in_layers(layers: &[PathBuf], subpath: &Path) -> std::io::Result<bool> {
    for layer in layers {
        let p = join_subpath(layer, subpath);
        match fs::symlink_metadata(&p) {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            // a parent component may be a non-directory in this layer
            Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// Resolves `subpath` against the first layer containing it
/// (ordered highest to lowest).
pub fn resolve_in_layers(layers: &[PathBuf], subpath: &Path) -> std::io::Result<Option<PathBuf>> {
    for layer in layers {
        let p = join_subpath(layer, subpath);
        match fs::symlink_metadata(&p) {
            Ok(_) => return Ok(Some(p)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
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

/// Walks `upperdir`, translating overlay markers into logical changes.
///
/// `lower_layers` is ordered highest to lowest and is consulted to classify
/// entries as `Add` versus `Modify` and to confirm whiteouts shadow real
/// content.
pub fn changes(
    upperdir: &Path,
    lower_layers: &[PathBuf],
    cancel: &CancelToken,
    cb: &mut ChangeFn<'_>,
) -> SnapshotResult<()> {
    walk_upper(upperdir, lower_layers, Path::new("/"), false, cancel, cb)
}

fn walk_upper(
    dir: &Path,
    lower_layers: &[PathBuf],
    subpath: &Path,
    all_adds: bool,
    cancel: &CancelToken,
    cb: &mut ChangeFn<'_>,
) -> SnapshotResult<()> {
    cancel.check()?;
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .map(|e| e.map(|e| (e.file_name(), e.path())))
        .collect::<Result<_, _>>()?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, path) in entries {
        cancel.check()?;
        let sub = subpath.join(&name);
        let meta = fs::symlink_metadata(&path)?;

        if is_whiteout(&meta) {
            cb(ChangeKind::Delete, &sub, None)?;
            continue;
        }

        if meta.is_dir() && is_opaque_dir(&path)? {
            // opaque directory: everything below the lower copy is replaced
            cb(ChangeKind::Delete, &sub, None)?;
            cb(ChangeKind::Add, &sub, Some(&meta))?;
            walk_upper(&path, lower_layers, &sub, true, cancel, cb)?;
            continue;
        }

        let kind = if all_adds || !exists_in_layers(lower_layers, &sub)? {
            ChangeKind::Add
        } else {
            ChangeKind::Modify
        };
        cb(kind, &sub, Some(&meta))?;
        if meta.is_dir() {
            walk_upper(&path, lower_layers, &sub, all_adds, cancel, cb)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(upperdir: &Path, lowers: &[PathBuf]) -> Vec<(ChangeKind, String)> {
        let mut out = Vec::new();
        changes(upperdir, lowers, &CancelToken::new(), &mut |kind, sub, _| {
            out.push((kind, sub.to_string_lossy().into_owned()));
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_add_and_modify_classification() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        fs::write(lower.path().join("existing"), b"1").unwrap();
        fs::write(upper.path().join("existing"), b"2").unwrap();
        fs::write(upper.path().join("fresh"), b"3").unwrap();

        let got = collect(upper.path(), &[lower.path().to_path_buf()]);
        assert_eq!(
            got,
            vec![
                (ChangeKind::Modify, "/existing".to_string()),
                (ChangeKind::Add, "/fresh".to_string()),
            ]
        );
    }

    #[test]
    fn test_whiteout_device_is_delete() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        fs::write(lower.path().join("gone"), b"1").unwrap();
        crate::sys::mknod(&upper.path().join("gone"), libc::S_IFCHR as u32, 0).unwrap();

        let got = collect(upper.path(), &[lower.path().to_path_buf()]);
        assert_eq!(got, vec![(ChangeKind::Delete, "/gone".to_string())]);
    }

    #[test]
    fn test_opaque_dir_is_delete_then_add() {
        let lower = tempfile::tempdir().unwrap();
        let upper = tempfile::tempdir().unwrap();
        fs::create_dir(lower.path().join("d")).unwrap();
        fs::write(lower.path().join("d/old"), b"1").unwrap();
        fs::create_dir(upper.path().join("d")).unwrap();
        fs::write(upper.path().join("d/new"), b"2").unwrap();
        if crate::sys::lsetxattr(&upper.path().join("d"), "user.overlay.opaque", b"y").is_err() {
            // xattrs unsupported on this filesystem; nothing to assert
            return;
        }

        let got = collect(upper.path(), &[lower.path().to_path_buf()]);
        assert_eq!(
            got,
            vec![
                (ChangeKind::Delete, "/d".to_string()),
                (ChangeKind::Add, "/d".to_string()),
                (ChangeKind::Add, "/d/new".to_string()),
            ]
        );
    }

    #[test]
    fn test_exists_in_layers_order() {
        let l1 = tempfile::tempdir().unwrap();
        let l2 = tempfile::tempdir().unwrap();
        fs::write(l2.path().join("f"), b"1").unwrap();
        let layers = vec![l1.path().to_path_buf(), l2.path().to_path_buf()];
        assert!(exists_in_layers(&layers, Path::new("/f")).unwrap());
        assert!(!exists_in_layers(&layers, Path::new("/missing")).unwrap());
        let resolved = resolve_in_layers(&layers, Path::new("/f")).unwrap().unwrap();
        assert_eq!(resolved, l2.path().join("f"));
    }
}
