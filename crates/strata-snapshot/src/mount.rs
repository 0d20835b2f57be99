//! Mount descriptions and overlay option helpers.
//!
//! A [`Mount`] is plain data describing how a snapshot's contents are exposed.
//! The cache core never performs kernel mounts itself; bind mounts resolve to
//! their source directory and overlay mounts are interpreted through their
//! `upperdir`/`lowerdir` options.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A single mount entry as produced by a snapshotter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount type: `bind`, `rbind` or `overlay`.
    pub mount_type: String,
    /// Mount source. For bind mounts this is the backing directory.
    pub source: PathBuf,
    /// Mount options, e.g. `rw`, `ro`, `upperdir=...`.
    pub options: Vec<String>,
}

impl Mount {
    /// Creates a read-write bind mount of a directory.
    pub fn bind(source: impl Into<PathBuf>) -> Mount {
        Mount {
            mount_type: "bind".to_string(),
            source: source.into(),
            options: vec!["rbind".to_string(), "rw".to_string()],
        }
    }

    /// Creates an overlay mount from its constituent directories.
    ///
    /// `lowerdirs` is ordered highest to lowest, matching the kernel option.
    pub fn overlay(upperdir: &std::path::Path, workdir: &std::path::Path, lowerdirs: &[PathBuf]) -> Mount {
        let lower = lowerdirs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        Mount {
            mount_type: "overlay".to_string(),
            source: PathBuf::from("overlay"),
            options: vec![
                format!("upperdir={}", upperdir.display()),
                format!("workdir={}", workdir.display()),
                format!("lowerdir={}", lower),
            ],
        }
    }

    /// Returns true for bind and rbind mounts.
    pub fn is_bind(&self) -> bool {
        self.mount_type == "bind" || self.mount_type == "rbind"
    }

    /// Returns true for overlay mounts.
    pub fn is_overlay(&self) -> bool {
        self.mount_type == "overlay"
    }

    /// Returns the value of a `name=value` option, if present.
    pub fn option_value(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}=", name);
        self.options
            .iter()
            .find_map(|o| o.strip_prefix(prefix.as_str()))
    }

    /// Returns the overlay `upperdir`, if any.
    pub fn upperdir(&self) -> Option<PathBuf> {
        self.option_value("upperdir").map(PathBuf::from)
    }

    /// Returns the overlay `workdir`, if any.
    pub fn workdir(&self) -> Option<PathBuf> {
        self.option_value("workdir").map(PathBuf::from)
    }

    /// Returns the overlay `lowerdir` entries, ordered highest to lowest.
    pub fn lowerdirs(&self) -> Vec<PathBuf> {
        match self.option_value("lowerdir") {
            Some(v) if !v.is_empty() => v.split(':').map(PathBuf::from).collect(),
            _ => Vec::new(),
        }
    }
}

/// Returns the layer directories of an overlay mount ordered lowest to
/// highest: the reversed `lowerdir` list followed by `upperdir` when present.
pub fn overlay_layers(mount: &Mount) -> Vec<PathBuf> {
    let mut layers: Vec<PathBuf> = mount.lowerdirs().into_iter().rev().collect();
    if let Some(upper) = mount.upperdir() {
        layers.push(upper);
    }
    layers
}

/// Detects the extra writable layer that `upper` adds on top of `lower`.
///
/// Returns the upperdir when `upper` is an overlay whose lower layers are
/// exactly the layers exposed by `lower` (a bind mount or a read-only
/// overlay view). This is the precondition for the overlay differ shortcut.
pub fn upperdir_of(lower: &[Mount], upper: &[Mount]) -> Option<PathBuf> {
    if lower.len() != 1 || upper.len() != 1 {
        return None;
    }
    let (lo, up) = (&lower[0], &upper[0]);
    if !up.is_overlay() {
        return None;
    }
    let upperdir = up.upperdir()?;
    let up_lowers = up.lowerdirs();
    if lo.is_bind() {
        if up_lowers.len() == 1 && up_lowers[0] == lo.source {
            return Some(upperdir);
        }
    } else if lo.is_overlay() && lo.upperdir().is_none() && up_lowers == lo.lowerdirs() {
        return Some(upperdir);
    }
    None
}

/// Rewrites a mount list to be read-only.
///
/// Bind mounts have `rw` replaced with `ro`; overlay mounts have the
/// `upperdir` folded into the head of `lowerdir` and `workdir` dropped.
pub fn set_readonly(mut mounts: Vec<Mount>) -> Vec<Mount> {
    for m in &mut mounts {
        if m.is_overlay() {
            m.options = readonly_overlay(std::mem::take(&mut m.options));
            continue;
        }
        let mut opts: Vec<String> = m
            .options
            .iter()
            .filter(|o| o.as_str() != "rw")
            .cloned()
            .collect();
        opts.push("ro".to_string());
        m.options = opts;
    }
    mounts
}

/// Rewrites overlay options so the mount exposes the same content read-only.
pub fn readonly_overlay(options: Vec<String>) -> Vec<String> {
    let mut upper = String::new();
    let mut out: Vec<String> = Vec::with_capacity(options.len());
    for o in options {
        if let Some(u) = o.strip_prefix("upperdir=") {
            upper = u.to_string();
        } else if !o.starts_with("workdir=") {
            out.push(o);
        }
    }
    if !upper.is_empty() {
        for o in &mut out {
            if let Some(lower) = o.strip_prefix("lowerdir=") {
                *o = format!("lowerdir={}:{}", upper, lower);
            }
        }
    }
    out
}
