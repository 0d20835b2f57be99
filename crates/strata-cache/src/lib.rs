#![warn(missing_docs)]

//! Strata cache core: a content-addressed store of layered filesystem
//! snapshots organized as a DAG of layer, merge and diff records.
//!
//! The [`CacheManager`] is the single entry point. Its accessors return
//! reference handles; handles expose mount, extract, finalize, commit and
//! release. Records deduplicate by chain identity, materialize lazily from
//! remote blobs, and are reclaimed through reference counting plus the
//! pruner's LRU-and-usage scoring.

pub mod compression;
pub mod desc;
pub mod error;
pub mod flight;
pub mod manager;
pub mod metadata;
pub mod prune;
pub mod refs;

mod lazy;
mod record;

pub use compression::{
    CompressionType, VARIANT_ANNOTATION_LABEL_PREFIX, VARIANT_DIGEST_LABEL_PREFIX,
    VARIANT_MEDIA_TYPE_LABEL,
};
pub use desc::{merge_handlers, BlobProvider, DescHandler, DescHandlers, Progress};
pub use error::{CacheError, CacheResult};
pub use flight::Group;
pub use manager::{CacheManager, ManagerOpt, RefOptions};
pub use metadata::{
    BatchOp, CacheMetadata, CachePolicy, KvStore, MemoryKvStore, MetadataStore, RecordType,
    SIZE_UNKNOWN,
};
pub use prune::{
    DiskUsageOptions, ExternalRefChecker, ExternalRefCheckerFn, PruneOptions, UsageFilter,
    UsageInfo,
};
pub use record::RecordKind;
pub use refs::{release_refs, ImmutableRef, MutableRef};
