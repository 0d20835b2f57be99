//! Strata test and validation infrastructure.
//!
//! Provides the in-process wiring used by the end-to-end suites: a
//! tempdir-backed environment assembling the native snapshotter, in-memory
//! content store, lease manager and metadata store into a cache manager,
//! plus helpers for building JSON layer blobs and reading mounted trees.

pub mod harness;

pub use harness::{
    handlers_for, pending_layer_blob, read_tree, write_layer_blob, CountingProvider, TestCache,
    TestEnv,
};

#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod proptest_chain;
