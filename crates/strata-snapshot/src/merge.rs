//! Merge snapshotter: materializing a snapshot as a composition of diffs.
//!
//! Wraps an inner [`Snapshotter`] and adds [`MergeSnapshotter::merge`], which
//! prepares a staging snapshot, streams every (lower, upper) diff through the
//! differ into the applier, and commits the result. The hardlink-aware usage
//! of the merged snapshot is persisted as a label so later `usage` calls do
//! not over-count content shared with source snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::applier::Applier;
use crate::cancel::CancelToken;
use crate::differ::Differ;
use crate::error::{SnapshotError, SnapshotResult};
use crate::lease::{flat_lease_labels, LeaseManager, Resource};
use crate::mount::Mount;
use crate::snapshotter::{Kind, SnapshotInfo, Snapshotter, Usage};

/// Snapshot label holding the merged usage of a snapshot built by `merge`.
pub const MERGE_USAGE_LABEL: &str = "strata.io/merge.usage";

/// One (lower, upper) pair in a merge. `None` stands for the empty tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDiff {
    /// Lower snapshot key.
    pub lower: Option<String>,
    /// Upper snapshot key.
    pub upper: Option<String>,
}

/// Configuration for the merge snapshotter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Attempt to hardlink file content from source snapshots instead of
    /// copying. Requires all snapshots to live on one filesystem.
    pub try_cross_snapshot_link: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { try_cross_snapshot_link: true }
    }
}

/// A snapshotter that can materialize merged snapshots.
pub struct MergeSnapshotter {
    inner: Arc<dyn Snapshotter>,
    leases: Arc<dyn LeaseManager>,
    config: MergeConfig,
}

impl MergeSnapshotter {
    /// Wraps an inner snapshotter.
    pub fn new(
        inner: Arc<dyn Snapshotter>,
        leases: Arc<dyn LeaseManager>,
        config: MergeConfig,
    ) -> Self {
        Self { inner, leases, config }
    }

    fn snapshot_resource(&self, key: &str) -> Resource {
        Resource {
            id: key.to_string(),
            kind: format!("snapshots/{}", self.inner.name()),
        }
    }

    /// Materializes `name` as the ordered composition of `diffs`.
    ///
    /// All intermediate state hangs off an ephemeral lease, so a failure at
    /// any point rolls back the staging snapshot and any views.
    pub fn merge(
        &self,
        cancel: &CancelToken,
        name: &str,
        diffs: &[LayerDiff],
    ) -> SnapshotResult<Usage> {
        let temp_lease = format!("{}-merge", name);
        match self.leases.create(&temp_lease, flat_lease_labels()) {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
        let result = self.merge_inner(cancel, name, diffs, &temp_lease);
        if let Err(e) = self.leases.delete(&temp_lease) {
            if !e.is_not_found() {
                warn!(lease = %temp_lease, error = %e, "failed to delete merge lease");
            }
        }
        result
    }

    fn merge_inner(
        &self,
        cancel: &CancelToken,
        name: &str,
        diffs: &[LayerDiff],
        temp_lease: &str,
    ) -> SnapshotResult<Usage> {
        let staging = format!("merge-{}", Uuid::new_v4().simple());
        self.add_temp_resource(temp_lease, &staging)?;
        let dest_mounts = self.inner.prepare(&staging, "", HashMap::new())?;
        let mut applier = Applier::for_mounts(&dest_mounts, self.config.try_cross_snapshot_link)?;

        for diff in diffs {
            cancel.check()?;
            let lower_mounts = match &diff.lower {
                Some(key) => Some(self.mounts_or_view(key, temp_lease)?),
                None => None,
            };
            let upper_mounts = match &diff.upper {
                Some(key) => self.mounts_or_view(key, temp_lease)?,
                None => self.empty_view(temp_lease)?,
            };
            let mut differ = Differ::new(lower_mounts.as_deref(), &upper_mounts)?;
            differ.handle_changes(cancel, &mut |c| applier.apply(cancel, c))?;
        }

        applier.flush()?;
        let usage = applier.usage()?;
        self.inner.commit(name, &staging)?;

        let mut info = self.inner.stat(name)?;
        info.labels.insert(
            MERGE_USAGE_LABEL.to_string(),
            serde_json::to_string(&usage).unwrap_or_default(),
        );
        self.inner
            .update(info, &[format!("labels.{}", MERGE_USAGE_LABEL)])?;

        debug!(name = %name, diffs = diffs.len(), size = usage.size, inodes = usage.inodes, "merged snapshot");
        Ok(usage)
    }

    fn add_temp_resource(&self, temp_lease: &str, key: &str) -> SnapshotResult<()> {
        match self
            .leases
            .add_resource(temp_lease, self.snapshot_resource(key))
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Returns mounts for a snapshot, creating an ephemeral view when it is
    /// committed.
    fn mounts_or_view(&self, key: &str, temp_lease: &str) -> SnapshotResult<Vec<Mount>> {
        let info = self.inner.stat(key)?;
        if info.kind == Kind::Committed {
            let view_key = format!("view-{}", Uuid::new_v4().simple());
            self.add_temp_resource(temp_lease, &view_key)?;
            self.inner.view(&view_key, key)
        } else {
            self.inner.mounts(key)
        }
    }

    fn empty_view(&self, temp_lease: &str) -> SnapshotResult<Vec<Mount>> {
        let view_key = format!("view-{}", Uuid::new_v4().simple());
        self.add_temp_resource(temp_lease, &view_key)?;
        self.inner.view(&view_key, "")
    }
}

impl Snapshotter for MergeSnapshotter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn prepare(
        &self,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> SnapshotResult<Vec<Mount>> {
        self.inner.prepare(key, parent, labels)
    }

    fn view(&self, key: &str, parent: &str) -> SnapshotResult<Vec<Mount>> {
        self.inner.view(key, parent)
    }

    fn mounts(&self, key: &str) -> SnapshotResult<Vec<Mount>> {
        self.inner.mounts(key)
    }

    fn commit(&self, name: &str, key: &str) -> SnapshotResult<()> {
        self.inner.commit(name, key)
    }

    fn stat(&self, key: &str) -> SnapshotResult<SnapshotInfo> {
        self.inner.stat(key)
    }

    fn update(&self, info: SnapshotInfo, fieldpaths: &[String]) -> SnapshotResult<SnapshotInfo> {
        self.inner.update(info, fieldpaths)
    }

    fn usage(&self, key: &str) -> SnapshotResult<Usage> {
        let info = self.inner.stat(key)?;
        if let Some(raw) = info.labels.get(MERGE_USAGE_LABEL) {
            if let Ok(usage) = serde_json::from_str::<Usage>(raw) {
                return Ok(usage);
            }
            return Err(SnapshotError::InvalidMount {
                reason: format!("corrupt merge usage label on {}", key),
            });
        }
        self.inner.usage(key)
    }

    fn remove(&self, key: &str) -> SnapshotResult<()> {
        self.inner.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::MemoryLeaseManager;
    use crate::native::NativeSnapshotter;

    fn setup() -> (tempfile::TempDir, MergeSnapshotter, Arc<MemoryLeaseManager>) {
        let dir = tempfile::tempdir().unwrap();
        let native = Arc::new(NativeSnapshotter::new(dir.path(), "native").unwrap());
        let leases = Arc::new(MemoryLeaseManager::new());
        let hook_sn = native.clone();
        leases.set_release_hook(Box::new(move |res: &Resource| {
            if res.kind.starts_with("snapshots/") {
                let _ = hook_sn.remove(&res.id);
            }
        }));
        let merge = MergeSnapshotter::new(native, leases.clone(), MergeConfig::default());
        (dir, merge, leases)
    }

    fn commit_tree(sn: &MergeSnapshotter, name: &str, parent: &str, files: &[(&str, &str)]) {
        let key = format!("{}-active", name);
        let mounts = sn.prepare(&key, parent, HashMap::new()).unwrap();
        let root = &mounts[0].source;
        for (path, content) in files {
            let p = root.join(path.trim_start_matches('/'));
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(p, content).unwrap();
        }
        sn.commit(name, &key).unwrap();
    }

    #[test]
    fn test_merge_upper_wins() {
        let (_dir, sn, leases) = setup();
        commit_tree(&sn, "x", "", &[("/x", "1")]);
        commit_tree(&sn, "y", "", &[("/x", "2"), ("/y", "3")]);

        let diffs = vec![
            LayerDiff { lower: None, upper: Some("x".to_string()) },
            LayerDiff { lower: None, upper: Some("y".to_string()) },
        ];
        sn.merge(&CancelToken::new(), "merged", &diffs).unwrap();

        let mounts = sn.mounts("merged").unwrap();
        let root = &mounts[0].source;
        assert_eq!(std::fs::read(root.join("x")).unwrap(), b"2");
        assert_eq!(std::fs::read(root.join("y")).unwrap(), b"3");
        // the ephemeral merge lease is gone
        assert!(!leases.contains("merged-merge"));
    }

    #[test]
    fn test_merge_applies_chain_diffs() {
        let (_dir, sn, _) = setup();
        commit_tree(&sn, "base", "", &[("/a", "1"), ("/b", "2")]);
        commit_tree(&sn, "child", "base", &[("/a", "overwritten"), ("/c", "3")]);

        let diffs = vec![
            LayerDiff { lower: None, upper: Some("base".to_string()) },
            LayerDiff { lower: Some("base".to_string()), upper: Some("child".to_string()) },
        ];
        sn.merge(&CancelToken::new(), "merged", &diffs).unwrap();

        let root = sn.mounts("merged").unwrap()[0].source.clone();
        assert_eq!(std::fs::read(root.join("a")).unwrap(), b"overwritten");
        assert_eq!(std::fs::read(root.join("b")).unwrap(), b"2");
        assert_eq!(std::fs::read(root.join("c")).unwrap(), b"3");
    }

    #[test]
    fn test_merged_usage_is_persisted() {
        let (_dir, sn, _) = setup();
        commit_tree(&sn, "x", "", &[("/f", "abc")]);
        let diffs = vec![LayerDiff { lower: None, upper: Some("x".to_string()) }];
        let usage = sn.merge(&CancelToken::new(), "merged", &diffs).unwrap();
        assert_eq!(sn.usage("merged").unwrap(), usage);
    }

    #[test]
    fn test_empty_diff_produces_empty_tree() {
        let (_dir, sn, _) = setup();
        commit_tree(&sn, "same", "", &[("/f", "1")]);
        let diffs = vec![LayerDiff {
            lower: Some("same".to_string()),
            upper: Some("same".to_string()),
        }];
        sn.merge(&CancelToken::new(), "merged", &diffs).unwrap();
        let root = sn.mounts("merged").unwrap()[0].source.clone();
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }
}
