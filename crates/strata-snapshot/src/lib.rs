#![warn(missing_docs)]

//! Strata snapshot subsystem: snapshotter, content-store and lease facades
//! plus the diff/apply engine that materializes merged snapshots.
//!
//! This crate defines the external contracts the cache core consumes
//! (snapshotter, content store, lease manager, layer applier) together with
//! in-process implementations, and the differ/applier pair that turns an
//! ordered list of snapshot diffs into an on-disk tree.

pub mod applier;
pub mod apply;
pub mod cancel;
pub mod content;
pub mod differ;
pub mod digest;
pub mod error;
pub mod lease;
pub mod local;
pub mod merge;
pub mod mount;
pub mod native;
pub mod overlay;
pub mod snapshotter;
pub mod walk;

mod sys;

pub use applier::{safe_join, Applier};
pub use apply::{encode_layer, LayerApplier, LayerEntry, LayerEntryKind, MockApplier};
pub use cancel::CancelToken;
pub use content::{
    ContentInfo, ContentStore, Descriptor, MemoryContentStore, UNCOMPRESSED_ANNOTATION,
};
pub use differ::{Change, ChangeStat, Differ};
pub use digest::Digest;
pub use error::{SnapshotError, SnapshotResult};
pub use lease::{
    flat_lease_labels, Lease, LeaseManager, MemoryLeaseManager, ReleaseHook, Resource,
    GC_FLAT_LABEL,
};
pub use local::LocalMounter;
pub use merge::{LayerDiff, MergeConfig, MergeSnapshotter, MERGE_USAGE_LABEL};
pub use mount::{overlay_layers, readonly_overlay, set_readonly, upperdir_of, Mount};
pub use native::NativeSnapshotter;
pub use snapshotter::{Kind, SnapshotInfo, Snapshotter, Usage};
pub use walk::ChangeKind;
