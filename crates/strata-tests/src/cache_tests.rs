//! End-to-end cache manager scenarios.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use strata_cache::{
    CacheError, CachePolicy, DiskUsageOptions, MetadataStore, PruneOptions, RefOptions,
    UsageFilter,
};
use strata_snapshot::{ContentStore, LeaseManager};
use strata_snapshot::{CancelToken, Digest, LayerEntry, Snapshotter};

use crate::harness::{
    handlers_for, pending_layer_blob, read_tree, write_layer_blob, CountingProvider, TestCache,
};

fn cancel() -> CancelToken {
    CancelToken::new()
}

fn meta_store(cache: &TestCache) -> MetadataStore {
    MetadataStore::new(cache.kv.clone())
}

#[test]
fn test_layer_composition() {
    let cache = TestCache::new();
    let desc_a = write_layer_blob(
        &cache.content,
        &[LayerEntry::file("/a", "1"), LayerEntry::file("/b", "2")],
    );
    let desc_b = write_layer_blob(
        &cache.content,
        &[LayerEntry::file("/a", "overwritten"), LayerEntry::file("/c", "3")],
    );

    let a = cache
        .manager
        .get_by_blob(&desc_a, None, &RefOptions::default())
        .unwrap();
    let b = cache
        .manager
        .get_by_blob(&desc_b, Some(&a), &RefOptions::default())
        .unwrap();

    let mounts = b.mount(&cancel(), true).unwrap();
    let tree = read_tree(&mounts);
    assert_eq!(tree.get("/a").map(String::as_str), Some("overwritten"));
    assert_eq!(tree.get("/b").map(String::as_str), Some("2"));
    assert_eq!(tree.get("/c").map(String::as_str), Some("3"));

    // chain identity composes over the parent chain
    let diff_a = desc_a.uncompressed_digest().unwrap();
    let diff_b = desc_b.uncompressed_digest().unwrap();
    assert_eq!(a.chain_id().unwrap(), Some(diff_a.clone()));
    assert_eq!(
        b.chain_id().unwrap(),
        Some(Digest::chain(&diff_a, &diff_b))
    );

    b.release().unwrap();
    a.release().unwrap();
}

#[test]
fn test_merge_with_overlap_upper_wins() {
    let cache = TestCache::new();
    let desc_x = write_layer_blob(&cache.content, &[LayerEntry::file("/x", "1")]);
    let desc_y = write_layer_blob(
        &cache.content,
        &[LayerEntry::file("/x", "2"), LayerEntry::file("/y", "3")],
    );

    let x = cache
        .manager
        .get_by_blob(&desc_x, None, &RefOptions::default())
        .unwrap();
    let y = cache
        .manager
        .get_by_blob(&desc_y, None, &RefOptions::default())
        .unwrap();

    let inputs = [x, y];
    let merged = cache
        .manager
        .merge(&inputs, &RefOptions::default())
        .unwrap()
        .expect("merge of two refs");
    let [x, y] = inputs;
    x.release().unwrap();
    y.release().unwrap();

    let chain = merged.layer_chain();
    assert_eq!(chain.len(), 2);
    strata_cache::release_refs(chain).unwrap();

    let mounts = merged.mount(&cancel(), true).unwrap();
    let tree = read_tree(&mounts);
    assert_eq!(tree.get("/x").map(String::as_str), Some("2"));
    assert_eq!(tree.get("/y").map(String::as_str), Some("3"));
    merged.release().unwrap();
}

#[test]
fn test_merge_boundaries_and_flattening() {
    let cache = TestCache::new();
    let mk = |name: &str| {
        let desc = write_layer_blob(&cache.content, &[LayerEntry::file(name, "v")]);
        cache
            .manager
            .get_by_blob(&desc, None, &RefOptions::default())
            .unwrap()
    };

    // merge of nothing is nothing
    assert!(cache
        .manager
        .merge(&[], &RefOptions::default())
        .unwrap()
        .is_none());

    // merge of one thing is that thing
    let a = mk("/a");
    let same = cache
        .manager
        .merge(std::slice::from_ref(&a), &RefOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(same.id(), a.id());
    same.release().unwrap();

    // a merge input that is itself a merge is flattened into its parents
    let b = mk("/b");
    let c = mk("/c");
    let ab_inputs = [a.clone_ref(), b.clone_ref()];
    let ab = cache
        .manager
        .merge(&ab_inputs, &RefOptions::default())
        .unwrap()
        .unwrap();
    strata_cache::release_refs(ab_inputs.into()).unwrap();
    let abc_inputs = [ab.clone_ref(), c.clone_ref()];
    let abc = cache
        .manager
        .merge(&abc_inputs, &RefOptions::default())
        .unwrap()
        .unwrap();
    strata_cache::release_refs(abc_inputs.into()).unwrap();

    let chain = abc.layer_chain();
    let chain_ids: Vec<String> = chain.iter().map(|r| r.id().to_string()).collect();
    assert_eq!(chain_ids, vec![a.id().to_string(), b.id().to_string(), c.id().to_string()]);
    strata_cache::release_refs(chain).unwrap();

    for r in [abc, ab, a, b, c] {
        r.release().unwrap();
    }
}

#[test]
fn test_diff_materializes_changes_only() {
    let cache = TestCache::new();
    let desc_a = write_layer_blob(
        &cache.content,
        &[LayerEntry::file("/a", "1"), LayerEntry::file("/b", "2")],
    );
    let desc_b = write_layer_blob(
        &cache.content,
        &[LayerEntry::file("/a", "overwritten"), LayerEntry::file("/c", "3")],
    );

    let a = cache
        .manager
        .get_by_blob(&desc_a, None, &RefOptions::default())
        .unwrap();
    let b = cache
        .manager
        .get_by_blob(&desc_b, Some(&a), &RefOptions::default())
        .unwrap();

    let d = cache
        .manager
        .diff(Some(&a), Some(&b), &RefOptions::default())
        .unwrap();
    let tree = read_tree(&d.mount(&cancel(), true).unwrap());
    assert_eq!(tree.get("/a").map(String::as_str), Some("overwritten"));
    assert_eq!(tree.get("/c").map(String::as_str), Some("3"));
    assert!(!tree.contains_key("/b"));

    d.release().unwrap();
    b.release().unwrap();
    a.release().unwrap();
}

#[test]
fn test_diff_of_identical_refs_is_empty() {
    let cache = TestCache::new();
    let desc = write_layer_blob(&cache.content, &[LayerEntry::file("/f", "1")]);
    let x = cache
        .manager
        .get_by_blob(&desc, None, &RefOptions::default())
        .unwrap();

    let d = cache
        .manager
        .diff(Some(&x), Some(&x), &RefOptions::default())
        .unwrap();
    let tree = read_tree(&d.mount(&cancel(), true).unwrap());
    assert!(tree.is_empty(), "diff of a ref against itself: {:?}", tree);

    d.release().unwrap();
    x.release().unwrap();
}

#[test]
fn test_diff_requires_an_input() {
    let cache = TestCache::new();
    let err = cache
        .manager
        .diff(None, None, &RefOptions::default())
        .unwrap_err();
    assert!(matches!(err, CacheError::Invalid { .. }));
}

#[test]
fn test_lazy_record_extracts_once() {
    let cache = TestCache::new();
    let (data, desc) = pending_layer_blob(&[LayerEntry::file("/lazy", "bytes")]);

    // without a handler and without the blob, the record cannot exist
    let err = cache
        .manager
        .get_by_blob(&desc, None, &RefOptions::default())
        .unwrap_err();
    assert!(matches!(err, CacheError::NeedsRemoteProviders(ref d) if d == &vec![desc.digest.clone()]));

    let provider = CountingProvider::new(cache.content.clone(), data);
    let opts = RefOptions {
        desc_handlers: handlers_for(&desc, provider.clone()),
        ..RefOptions::default()
    };
    let r = cache.manager.get_by_blob(&desc, None, &opts).unwrap();

    // a lookup without handlers reports the missing digests
    let err = cache
        .manager
        .get(r.id(), &RefOptions::default())
        .unwrap_err();
    assert!(matches!(err, CacheError::NeedsRemoteProviders(ref d) if d == &vec![desc.digest.clone()]));

    // first extract fetches once, the second is a no-op
    r.extract(&cancel()).unwrap();
    assert_eq!(provider.fetches(), 1);
    r.extract(&cancel()).unwrap();
    assert_eq!(provider.fetches(), 1);

    let tree = read_tree(&r.mount(&cancel(), true).unwrap());
    assert_eq!(tree.get("/lazy").map(String::as_str), Some("bytes"));
    r.release().unwrap();
}

#[test]
fn test_cancelled_extract_leaves_record_lazy() {
    let cache = TestCache::new();
    let (data, desc) = pending_layer_blob(&[LayerEntry::file("/lazy", "bytes")]);
    let provider = CountingProvider::new(cache.content.clone(), data);
    let opts = RefOptions {
        desc_handlers: handlers_for(&desc, provider.clone()),
        ..RefOptions::default()
    };
    let r = cache.manager.get_by_blob(&desc, None, &opts).unwrap();

    let cancelled = CancelToken::new();
    cancelled.cancel();
    let err = r.extract(&cancelled).unwrap_err();
    assert!(matches!(err, CacheError::Cancelled));

    // the record is still blob-only and no snapshot exists
    let md = meta_store(&cache).metadata(r.id());
    assert_eq!(md.get_blob_only().unwrap(), Some(true));
    let snapshot_id = md.get_snapshot_id().unwrap().unwrap();
    assert!(cache.snapshotter.stat(&snapshot_id).is_err());

    // a later extract retries cleanly
    r.extract(&cancel()).unwrap();
    assert_eq!(md.get_blob_only().unwrap(), Some(false));
    assert!(cache.snapshotter.stat(&snapshot_id).is_ok());
    r.release().unwrap();
}

#[test]
fn test_failed_fetch_is_retryable() {
    let cache = TestCache::new();
    let (data, desc) = pending_layer_blob(&[LayerEntry::file("/f", "1")]);
    let provider = CountingProvider::new(cache.content.clone(), data);
    provider.set_fail(true);
    let opts = RefOptions {
        desc_handlers: handlers_for(&desc, provider.clone()),
        ..RefOptions::default()
    };
    let r = cache.manager.get_by_blob(&desc, None, &opts).unwrap();

    assert!(r.extract(&cancel()).is_err());
    assert_eq!(provider.fetches(), 1);

    provider.set_fail(false);
    r.extract(&cancel()).unwrap();
    assert_eq!(provider.fetches(), 2);
    r.release().unwrap();
}

#[test]
fn test_get_by_blob_deduplicates_by_blob_chain() {
    let cache = TestCache::new();
    let desc = write_layer_blob(&cache.content, &[LayerEntry::file("/f", "1")]);

    let first = cache
        .manager
        .get_by_blob(&desc, None, &RefOptions::default())
        .unwrap();
    let opts = RefOptions {
        image_refs: vec!["registry.test/app:latest".to_string()],
        ..RefOptions::default()
    };
    let second = cache.manager.get_by_blob(&desc, None, &opts).unwrap();
    assert_eq!(first.id(), second.id());

    // image refs append even when an existing record is reused
    let md = meta_store(&cache).metadata(first.id());
    assert_eq!(md.get_image_refs().unwrap(), vec!["registry.test/app:latest".to_string()]);

    second.release().unwrap();
    first.release().unwrap();
}

#[test]
fn test_chain_match_reuses_snapshot_across_compression() {
    let cache = TestCache::new();
    let desc = write_layer_blob(&cache.content, &[LayerEntry::file("/f", "1")]);
    let first = cache
        .manager
        .get_by_blob(&desc, None, &RefOptions::default())
        .unwrap();

    // a different encoding of the same layer: same uncompressed digest,
    // different blob digest
    let alt_data = b"alt-encoding".to_vec();
    cache.content.write(alt_data.clone()).unwrap();
    let mut alt = desc.clone();
    alt.digest = Digest::from_bytes(&alt_data);
    alt.size = alt_data.len() as i64;

    let second = cache
        .manager
        .get_by_blob(&alt, None, &RefOptions::default())
        .unwrap();
    assert_ne!(first.id(), second.id());

    let store = meta_store(&cache);
    let snap_first = store.metadata(first.id()).get_snapshot_id().unwrap();
    let snap_second = store.metadata(second.id()).get_snapshot_id().unwrap();
    assert_eq!(snap_first, snap_second);

    second.release().unwrap();
    first.release().unwrap();
}

#[test]
fn test_commit_and_finalize_lifecycle() {
    let cache = TestCache::new();
    let retain = RefOptions { cache_policy: Some(CachePolicy::Retain), ..RefOptions::default() };

    let m = cache.manager.new_mutable(&cancel(), None, &retain).unwrap();
    let mounts = m.mount(&cancel(), false).unwrap();
    std::fs::write(mounts[0].source.join("file"), b"written").unwrap();

    let im = m.commit().unwrap();
    // before finalize the immutable delegates to the mutable's snapshot
    let tree = read_tree(&im.mount(&cancel(), true).unwrap());
    assert_eq!(tree.get("/file").map(String::as_str), Some("written"));

    im.finalize().unwrap();
    im.finalize().unwrap(); // idempotent

    // the mutable twin is gone and the committed snapshot carries the data
    let err = cache
        .manager
        .get_mutable(m.id(), &RefOptions::default())
        .unwrap_err();
    assert!(err.is_not_found());
    let store = meta_store(&cache);
    let snap = store.metadata(im.id()).get_snapshot_id().unwrap().unwrap();
    assert_eq!(
        cache.snapshotter.stat(&snap).unwrap().kind,
        strata_snapshot::Kind::Committed
    );

    // children stack on top of the finalized parent
    let child = cache
        .manager
        .new_mutable(&cancel(), Some(&im), &retain)
        .unwrap();
    let child_mounts = child.mount(&cancel(), false).unwrap();
    std::fs::write(child_mounts[0].source.join("more"), b"data").unwrap();
    let child_im = child.commit().unwrap();
    let tree = read_tree(&child_im.mount(&cancel(), true).unwrap());
    assert_eq!(tree.get("/file").map(String::as_str), Some("written"));
    assert_eq!(tree.get("/more").map(String::as_str), Some("data"));

    child_im.release().unwrap();
    child.release().unwrap();
    im.release().unwrap();
    m.release().unwrap();
}

#[test]
fn test_mutable_record_is_locked_while_referenced() {
    let cache = TestCache::new();
    let m = cache
        .manager
        .new_mutable(&cancel(), None, &RefOptions::default())
        .unwrap();

    let err = cache.manager.get(m.id(), &RefOptions::default()).unwrap_err();
    assert!(err.is_locked());
    let err = cache
        .manager
        .get_mutable(m.id(), &RefOptions::default())
        .unwrap_err();
    assert!(err.is_locked());

    let id = m.id().to_string();
    m.release().unwrap();
    // a default-policy mutable is torn down on release
    let err = cache.manager.get(&id, &RefOptions::default()).unwrap_err();
    assert!(err.is_not_found());
    assert!(!cache.leases.contains(&id));
}

#[test]
fn test_implicit_commit_and_twin_removal() {
    let cache = TestCache::new();
    let retain = RefOptions { cache_policy: Some(CachePolicy::Retain), ..RefOptions::default() };
    let m = cache.manager.new_mutable(&cancel(), None, &retain).unwrap();
    let mid = m.id().to_string();
    m.release().unwrap(); // retained: record survives

    // get on a mutable record without a twin commits it implicitly
    let im = cache.manager.get(&mid, &RefOptions::default()).unwrap();
    assert_ne!(im.id(), mid);

    // while the immutable twin is referenced, the mutable is locked
    let err = cache.manager.get_mutable(&mid, &RefOptions::default()).unwrap_err();
    assert!(err.is_locked());

    let im_id = im.id().to_string();
    im.release().unwrap();

    // with the twin unreferenced, get_mutable removes it
    let m2 = cache.manager.get_mutable(&mid, &RefOptions::default()).unwrap();
    let err = cache.manager.get(&im_id, &RefOptions::default()).unwrap_err();
    assert!(err.is_not_found());
    m2.release().unwrap();
}

#[test]
fn test_disk_usage_double_ref_propagation() {
    let cache = TestCache::new();
    let retain = RefOptions { cache_policy: Some(CachePolicy::Retain), ..RefOptions::default() };

    let desc = write_layer_blob(&cache.content, &[LayerEntry::file("/base", "b")]);
    let parent = cache.manager.get_by_blob(&desc, None, &retain).unwrap();
    let parent_id = parent.id().to_string();

    let m = cache
        .manager
        .new_mutable(&cancel(), Some(&parent), &retain)
        .unwrap();
    parent.release().unwrap();
    let im = m.commit().unwrap();
    m.release().unwrap(); // retained: the pair stays

    // the immutable side is referenced, so the parent stays in use
    let du = cache
        .manager
        .disk_usage(&cancel(), &DiskUsageOptions::default())
        .unwrap();
    let parent_info = du.iter().find(|u| u.id == parent_id).unwrap();
    assert!(parent_info.in_use);

    im.release().unwrap();

    // with the pair unreferenced, the equal pair decrements the parent twice
    // and it drops out of use
    let du = cache
        .manager
        .disk_usage(&cancel(), &DiskUsageOptions::default())
        .unwrap();
    let parent_info = du.iter().find(|u| u.id == parent_id).unwrap();
    assert!(!parent_info.in_use);
}

#[test]
fn test_prune_by_keep_duration() {
    let cache = TestCache::new();
    let mut ids = Vec::new();
    for i in 0..3 {
        let desc = write_layer_blob(
            &cache.content,
            &[LayerEntry::file("/f", &format!("record-{}", i))],
        );
        let r = cache
            .manager
            .get_by_blob(&desc, None, &RefOptions::default())
            .unwrap();
        ids.push(r.id().to_string());
        r.release().unwrap();
    }

    let store = meta_store(&cache);
    let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 3600);
    store.metadata(&ids[0]).set_last_used_at(two_hours_ago).unwrap();
    store.metadata(&ids[2]).set_last_used_at(two_hours_ago).unwrap();

    cache
        .manager
        .prune(
            &cancel(),
            None,
            &[PruneOptions {
                keep_duration: Some(Duration::from_secs(3600)),
                ..PruneOptions::default()
            }],
        )
        .unwrap();

    assert!(cache
        .manager
        .get(&ids[0], &RefOptions::default())
        .unwrap_err()
        .is_not_found());
    assert!(cache.manager.get(&ids[1], &RefOptions::default()).is_ok());
    assert!(cache
        .manager
        .get(&ids[2], &RefOptions::default())
        .unwrap_err()
        .is_not_found());
    assert!(!cache.leases.contains(&ids[0]));
    assert!(!cache.leases.contains(&ids[2]));
}

#[test]
fn test_prune_gc_scoring_under_byte_budget() {
    let cache = TestCache::new();
    let now = SystemTime::now();
    let store = meta_store(&cache);

    // four unused records; last-used ranks 1..4, usage-count ranks (1,1,5,5)
    let mut ids = Vec::new();
    for i in 0..4usize {
        let desc = write_layer_blob(
            &cache.content,
            &[LayerEntry::file("/f", &format!("payload-{}-xxxxxxxxxxxxxxxx", i))],
        );
        let r = cache
            .manager
            .get_by_blob(&desc, None, &RefOptions::default())
            .unwrap();
        ids.push(r.id().to_string());
        r.release().unwrap();
    }
    for (i, id) in ids.iter().enumerate() {
        let md = store.metadata(id);
        if i >= 2 {
            for _ in 0..4 {
                md.update_last_used().unwrap();
            }
        }
        let age = Duration::from_secs((4 - i as u64) * 3600);
        md.set_last_used_at(now - age).unwrap();
    }

    let du = cache
        .manager
        .disk_usage(&cancel(), &DiskUsageOptions::default())
        .unwrap();
    let size_of = |id: &str| du.iter().find(|u| u.id == id).unwrap().size;
    let total: i64 = ids.iter().map(|id| size_of(id)).sum();
    // budget that exactly forces out the two lowest-scored records
    let keep_bytes = total - size_of(&ids[0]) - size_of(&ids[1]) + 1;

    cache
        .manager
        .prune(
            &cancel(),
            None,
            &[PruneOptions { keep_bytes, ..PruneOptions::default() }],
        )
        .unwrap();

    // ids[0] and ids[1] score lowest (oldest and least used) and are gone
    assert!(cache
        .manager
        .get(&ids[0], &RefOptions::default())
        .unwrap_err()
        .is_not_found());
    assert!(cache
        .manager
        .get(&ids[1], &RefOptions::default())
        .unwrap_err()
        .is_not_found());
    assert!(cache.manager.get(&ids[2], &RefOptions::default()).is_ok());
    assert!(cache.manager.get(&ids[3], &RefOptions::default()).is_ok());
}

#[test]
fn test_prune_skips_referenced_and_filtered_records() {
    let cache = TestCache::new();
    let desc_a = write_layer_blob(&cache.content, &[LayerEntry::file("/a", "1")]);
    let desc_b = write_layer_blob(&cache.content, &[LayerEntry::file("/b", "2")]);

    let held = cache
        .manager
        .get_by_blob(&desc_a, None, &RefOptions::default())
        .unwrap();
    let released = cache
        .manager
        .get_by_blob(&desc_b, None, &RefOptions::default())
        .unwrap();
    let released_id = released.id().to_string();
    released.release().unwrap();

    // a filter restricted to an unrelated id removes nothing
    cache
        .manager
        .prune(
            &cancel(),
            None,
            &[PruneOptions {
                filter: Some(UsageFilter { ids: vec!["nope".to_string()], ..Default::default() }),
                ..PruneOptions::default()
            }],
        )
        .unwrap();
    assert!(cache.manager.get(&released_id, &RefOptions::default()).is_ok());

    // an unfiltered prune removes only the unreferenced record
    let (tx, rx) = std::sync::mpsc::channel();
    cache
        .manager
        .prune(&cancel(), Some(&tx), &[PruneOptions::default()])
        .unwrap();
    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, released_id);

    assert!(cache.manager.get(held.id(), &RefOptions::default()).is_ok());
    held.release().unwrap();
}

#[test]
fn test_prune_skips_internal_records_unless_all() {
    let cache = TestCache::new();
    let desc = write_layer_blob(&cache.content, &[LayerEntry::file("/f", "1")]);
    let opts = RefOptions {
        record_type: Some(strata_cache::RecordType::Internal),
        ..RefOptions::default()
    };
    let r = cache.manager.get_by_blob(&desc, None, &opts).unwrap();
    let id = r.id().to_string();
    r.release().unwrap();

    cache
        .manager
        .prune(&cancel(), None, &[PruneOptions::default()])
        .unwrap();
    assert!(cache.manager.get(&id, &RefOptions::default()).is_ok());

    cache
        .manager
        .prune(&cancel(), None, &[PruneOptions { all: true, ..PruneOptions::default() }])
        .unwrap();
    assert!(cache
        .manager
        .get(&id, &RefOptions::default())
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_prune_skips_externally_shared_records() {
    struct EverythingShared;
    impl strata_cache::ExternalRefChecker for EverythingShared {
        fn exists(&self, _id: &str, _chain: &[Digest]) -> bool {
            true
        }
    }
    let checker: strata_cache::ExternalRefCheckerFn =
        Arc::new(|| Ok(Box::new(EverythingShared) as Box<dyn strata_cache::ExternalRefChecker>));
    let cache = TestCache::with_ref_checker(checker);

    let desc = write_layer_blob(&cache.content, &[LayerEntry::file("/f", "1")]);
    let r = cache
        .manager
        .get_by_blob(&desc, None, &RefOptions::default())
        .unwrap();
    let id = r.id().to_string();
    r.release().unwrap();

    // shared records are reported shared and survive a default prune
    let du = cache
        .manager
        .disk_usage(&cancel(), &DiskUsageOptions::default())
        .unwrap();
    assert!(du.iter().find(|u| u.id == id).unwrap().shared);
    cache
        .manager
        .prune(&cancel(), None, &[PruneOptions::default()])
        .unwrap();
    assert!(cache.manager.get(&id, &RefOptions::default()).is_ok());

    // an explicit all-prune reclaims them
    cache
        .manager
        .prune(&cancel(), None, &[PruneOptions { all: true, ..PruneOptions::default() }])
        .unwrap();
    assert!(cache
        .manager
        .get(&id, &RefOptions::default())
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_restart_restores_records() {
    let mut cache = TestCache::new();
    let desc = write_layer_blob(&cache.content, &[LayerEntry::file("/f", "1")]);
    let r = cache
        .manager
        .get_by_blob(&desc, None, &RefOptions::default())
        .unwrap();
    r.extract(&cancel()).unwrap();
    let id = r.id().to_string();
    r.release().unwrap();

    cache = cache.restart();
    let r = cache.manager.get(&id, &RefOptions::default()).unwrap();
    let tree = read_tree(&r.mount(&cancel(), true).unwrap());
    assert_eq!(tree.get("/f").map(String::as_str), Some("1"));
    r.release().unwrap();
}

#[test]
fn test_restart_completes_crashed_deletion() {
    let mut cache = TestCache::new();
    let desc = write_layer_blob(&cache.content, &[LayerEntry::file("/f", "1")]);
    let r = cache
        .manager
        .get_by_blob(&desc, None, &RefOptions::default())
        .unwrap();
    let id = r.id().to_string();
    r.release().unwrap();

    // simulate a crash after removal was marked but before cleanup ran
    let md = meta_store(&cache).metadata(&id);
    md.queue_deleted(&true).unwrap();
    md.commit_metadata().unwrap();

    cache = cache.restart();
    assert!(cache
        .manager
        .get(&id, &RefOptions::default())
        .unwrap_err()
        .is_not_found());
    assert!(!meta_store(&cache).exists(&id).unwrap());
}

#[test]
fn test_concurrent_extracts_coalesce() {
    let cache = TestCache::new();
    let (data, desc) = pending_layer_blob(&[LayerEntry::file("/f", "once")]);
    let provider = CountingProvider::new(cache.content.clone(), data);
    let opts = RefOptions {
        desc_handlers: handlers_for(&desc, provider.clone()),
        ..RefOptions::default()
    };
    let r = cache.manager.get_by_blob(&desc, None, &opts).unwrap();

    std::thread::scope(|s| {
        let mut handles = Vec::new();
        for _ in 0..4 {
            let r = r.clone_ref();
            handles.push(s.spawn(move || {
                r.extract(&CancelToken::new()).unwrap();
                r.release().unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    });

    assert_eq!(provider.fetches(), 1);
    r.release().unwrap();
}

#[test]
fn test_compression_variant_roundtrip() {
    let cache = TestCache::new();
    let desc = write_layer_blob(&cache.content, &[LayerEntry::file("/f", "1")]);
    let r = cache
        .manager
        .get_by_blob(&desc, None, &RefOptions::default())
        .unwrap();

    let err = r
        .get_compression_blob(strata_cache::CompressionType::Zstd)
        .unwrap_err();
    assert!(err.is_not_found());

    let variant_data = b"zstd-encoded-bytes".to_vec();
    let variant_digest = cache.content.write(variant_data.clone()).unwrap();
    let variant = strata_snapshot::Descriptor {
        digest: variant_digest.clone(),
        size: variant_data.len() as i64,
        media_type: "application/vnd.test.layer+zstd".to_string(),
        annotations: HashMap::new(),
    };
    r.add_compression_blob(&variant, strata_cache::CompressionType::Zstd)
        .unwrap();

    let got = r
        .get_compression_blob(strata_cache::CompressionType::Zstd)
        .unwrap();
    assert_eq!(got.digest, variant_digest);
    assert_eq!(got.media_type, variant.media_type);

    // the variant is kept alive by the record's lease
    let resources = cache.leases.resources(r.id()).unwrap();
    assert!(resources
        .iter()
        .any(|res| res.kind == "content" && res.id == variant_digest.to_string()));

    // variant sizes count toward the record size
    let size = r.size().unwrap();
    assert!(size >= desc.size + variant.size);

    r.release().unwrap();
}
