//! Test harness: in-process cache wiring over a tempdir.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use strata_cache::{
    BlobProvider, CacheManager, CacheResult, DescHandler, DescHandlers, ExternalRefCheckerFn,
    ManagerOpt,
};
use strata_snapshot::{
    encode_layer, CancelToken, ContentStore, Descriptor, Digest, LayerEntry, MemoryContentStore,
    MemoryLeaseManager, MergeConfig, MergeSnapshotter, MockApplier, Mount, NativeSnapshotter,
    Resource, Snapshotter, UNCOMPRESSED_ANNOTATION,
};

/// Tempdir-backed test environment.
pub struct TestEnv {
    temp_dir: TempDir,
}

impl TestEnv {
    /// Creates a fresh environment.
    pub fn new() -> Self {
        Self { temp_dir: tempfile::tempdir().expect("failed to create temp dir") }
    }

    /// The environment's scratch directory.
    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully wired cache manager plus its collaborators.
pub struct TestCache {
    /// The manager under test.
    pub manager: CacheManager,
    /// The snapshotter stack.
    pub snapshotter: Arc<MergeSnapshotter>,
    /// The blob store.
    pub content: Arc<MemoryContentStore>,
    /// The lease manager.
    pub leases: Arc<MemoryLeaseManager>,
    /// The metadata KV store.
    pub kv: Arc<strata_cache::MemoryKvStore>,
    env: TestEnv,
}

impl TestCache {
    /// Builds a cache over a fresh tempdir.
    pub fn new() -> TestCache {
        Self::build(None)
    }

    /// Builds a cache wired with an external ref checker.
    pub fn with_ref_checker(checker: ExternalRefCheckerFn) -> TestCache {
        Self::build(Some(checker))
    }

    fn build(ref_checker: Option<ExternalRefCheckerFn>) -> TestCache {
        let env = TestEnv::new();
        let native = Arc::new(
            NativeSnapshotter::new(env.tempdir().join("snapshots"), "native")
                .expect("snapshotter setup"),
        );
        let leases = Arc::new(MemoryLeaseManager::new());
        let content: Arc<MemoryContentStore> = Arc::new(MemoryContentStore::new());

        let hook_sn = native.clone();
        let hook_cs = content.clone();
        leases.set_release_hook(Box::new(move |res: &Resource| {
            if res.kind.starts_with("snapshots/") {
                let _ = hook_sn.remove(&res.id);
            } else if res.kind == "content" {
                if let Some(digest) = Digest::parse(&res.id) {
                    let _ = hook_cs.delete(&digest);
                }
            }
        }));

        let snapshotter = Arc::new(MergeSnapshotter::new(
            native,
            leases.clone(),
            MergeConfig::default(),
        ));
        let kv = Arc::new(strata_cache::MemoryKvStore::new());
        let manager = CacheManager::new(ManagerOpt {
            snapshotter: snapshotter.clone(),
            content_store: content.clone(),
            lease_manager: leases.clone(),
            applier: Arc::new(MockApplier::new(content.clone())),
            kv_store: kv.clone(),
            ref_checker,
        })
        .expect("manager setup");

        TestCache { manager, snapshotter, content, leases, kv, env }
    }

    /// Rebuilds the manager over the same stores, simulating a restart.
    pub fn restart(self) -> TestCache {
        let TestCache { manager, snapshotter, content, leases, kv, env } = self;
        drop(manager);
        let manager = CacheManager::new(ManagerOpt {
            snapshotter: snapshotter.clone(),
            content_store: content.clone(),
            lease_manager: leases.clone(),
            applier: Arc::new(MockApplier::new(content.clone())),
            kv_store: kv.clone(),
            ref_checker: None,
        })
        .expect("manager restart");
        TestCache { manager, snapshotter, content, leases, kv, env }
    }

    /// The scratch directory backing this cache.
    pub fn tempdir(&self) -> &Path {
        self.env.tempdir()
    }
}

impl Default for TestCache {
    fn default() -> Self {
        Self::new()
    }
}

fn descriptor_for(data: &[u8]) -> Descriptor {
    let digest = Digest::from_bytes(data);
    // the JSON payload is stored uncompressed, so the diff id equals the
    // blob digest
    let diff_id = digest.clone();
    Descriptor {
        digest,
        size: data.len() as i64,
        media_type: "application/vnd.strata.layer.v1+json".to_string(),
        annotations: HashMap::from([(
            UNCOMPRESSED_ANNOTATION.to_string(),
            diff_id.to_string(),
        )]),
    }
}

/// Encodes a layer payload, writes it to the content store, and returns its
/// descriptor.
pub fn write_layer_blob(content: &MemoryContentStore, entries: &[LayerEntry]) -> Descriptor {
    let data = encode_layer(entries);
    content.write(data.clone()).expect("blob write");
    descriptor_for(&data)
}

/// Encodes a layer payload without storing it, for lazy-record tests.
pub fn pending_layer_blob(entries: &[LayerEntry]) -> (Vec<u8>, Descriptor) {
    let data = encode_layer(entries);
    let desc = descriptor_for(&data);
    (data, desc)
}

/// A provider that counts fetches and can be told to fail.
pub struct CountingProvider {
    content: Arc<MemoryContentStore>,
    data: Vec<u8>,
    fetches: AtomicUsize,
    fail: AtomicBool,
}

impl CountingProvider {
    /// A provider that writes `data` into `content` on fetch.
    pub fn new(content: Arc<MemoryContentStore>, data: Vec<u8>) -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            content,
            data,
            fetches: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    /// Number of fetch calls observed.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Makes subsequent fetches fail (or succeed again).
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl BlobProvider for CountingProvider {
    fn fetch(&self, cancel: &CancelToken, _desc: &Descriptor) -> CacheResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        cancel.check()?;
        if self.fail.load(Ordering::SeqCst) {
            return Err(strata_cache::CacheError::Invalid {
                reason: "provider failure injected".to_string(),
            });
        }
        self.content.write(self.data.clone())?;
        Ok(())
    }
}

/// Builds a handler map registering `provider` for `desc`.
pub fn handlers_for(desc: &Descriptor, provider: Arc<dyn BlobProvider>) -> DescHandlers {
    HashMap::from([(desc.digest.clone(), Arc::new(DescHandler::new(provider)))])
}

/// Reads the file contents under a mounted tree as `subpath -> content`.
/// Symlinks appear as `-> target`.
pub fn read_tree(mounts: &[Mount]) -> BTreeMap<String, String> {
    let root = mounts[0].source.clone();
    let mut out = BTreeMap::new();
    read_dir_into(&root, &root, &mut out);
    out
}

fn read_dir_into(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .expect("read_dir")
        .map(|e| e.expect("dir entry").path())
        .collect();
    entries.sort();
    for path in entries {
        let sub = format!(
            "/{}",
            path.strip_prefix(root).expect("subpath").to_string_lossy()
        );
        let meta = std::fs::symlink_metadata(&path).expect("lstat");
        if meta.is_dir() {
            read_dir_into(root, &path, out);
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&path).expect("readlink");
            out.insert(sub, format!("-> {}", target.to_string_lossy()));
        } else {
            let content = std::fs::read(&path).unwrap_or_default();
            out.insert(sub, String::from_utf8_lossy(&content).into_owned());
        }
    }
}
