//! Snapshotter contract.
//!
//! A snapshotter manages on-disk filesystem snapshots addressed by string
//! keys. Active snapshots are writable working sets; committed snapshots are
//! immutable and can parent further snapshots; views are read-only
//! materializations of committed content.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::SnapshotResult;
use crate::mount::Mount;

/// Lifecycle state of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    /// Writable working snapshot.
    Active,
    /// Immutable, committed snapshot.
    Committed,
    /// Read-only view of a committed snapshot.
    View,
}

/// Metadata describing a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// The snapshot key.
    pub name: String,
    /// Parent snapshot key, if any.
    pub parent: Option<String>,
    /// Lifecycle state.
    pub kind: Kind,
    /// Free-form labels attached to the snapshot.
    pub labels: HashMap<String, String>,
}

/// Disk usage of a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Bytes used, in filesystem block granularity.
    pub size: i64,
    /// Number of inodes used.
    pub inodes: i64,
}

impl Usage {
    /// Accumulates another usage value into this one.
    pub fn add(&mut self, other: Usage) {
        self.size += other.size;
        self.inodes += other.inodes;
    }
}

/// Contract for on-disk snapshot management.
///
/// Implementations must be thread-safe: the cache manager issues calls from
/// multiple threads concurrently. `NotFound` and `AlreadyExists` errors are
/// part of the contract; idempotent callers tolerate `AlreadyExists` from
/// `prepare` and `commit`.
pub trait Snapshotter: Send + Sync {
    /// Returns the snapshotter's name, used to scope lease resource types.
    fn name(&self) -> &str;

    /// Creates a new active snapshot on top of `parent` (empty for none) and
    /// returns its mounts. `labels` are stored on the snapshot.
    fn prepare(
        &self,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> SnapshotResult<Vec<Mount>>;

    /// Creates a read-only view of `parent` (empty for an empty view) and
    /// returns its mounts.
    fn view(&self, key: &str, parent: &str) -> SnapshotResult<Vec<Mount>>;

    /// Returns the mounts of an existing snapshot.
    fn mounts(&self, key: &str) -> SnapshotResult<Vec<Mount>>;

    /// Commits the active snapshot `key` as the committed snapshot `name`.
    fn commit(&self, name: &str, key: &str) -> SnapshotResult<()>;

    /// Returns metadata for a snapshot.
    fn stat(&self, key: &str) -> SnapshotResult<SnapshotInfo>;

    /// Updates snapshot metadata. `fieldpaths` selects the fields to change,
    /// e.g. `labels.foo`; an empty label value removes the label.
    fn update(&self, info: SnapshotInfo, fieldpaths: &[String]) -> SnapshotResult<SnapshotInfo>;

    /// Returns the disk usage of a snapshot.
    fn usage(&self, key: &str) -> SnapshotResult<Usage>;

    /// Deletes a snapshot and its on-disk state.
    fn remove(&self, key: &str) -> SnapshotResult<()>;
}
