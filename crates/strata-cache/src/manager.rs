//! The cache manager: the single entry point of the layer cache.
//!
//! All operations that mutate the record map run under the manager mutex;
//! per-record state is additionally guarded by the record's (shared twin)
//! mutex. The manager mutex is always acquired before record mutexes, and
//! record locks are only taken upward (child before parent).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tracing::{debug, info};
use uuid::Uuid;

use strata_snapshot::{
    flat_lease_labels, CancelToken, ContentStore, Descriptor, Digest, LayerApplier, LeaseManager,
    MergeSnapshotter, Resource, Snapshotter,
};

use crate::desc::DescHandlers;
use crate::error::{CacheError, CacheResult};
use crate::flight::Group;
use crate::metadata::{CacheMetadata, CachePolicy, KvStore, MetadataStore, RecordType};
use crate::prune::ExternalRefCheckerFn;
use crate::record::{
    walk_unique_ancestors, CacheRecord, ParentRefs, RecordKind, RecordState,
};
use crate::refs::{
    commit_locked, new_immutable, new_mutable, release_refs, ImmutableRef, MutableRef,
};

/// Construction options for [`CacheManager`].
pub struct ManagerOpt {
    /// The merge-capable snapshotter.
    pub snapshotter: Arc<MergeSnapshotter>,
    /// The content store holding blobs.
    pub content_store: Arc<dyn ContentStore>,
    /// The lease manager protecting snapshots and blobs from GC.
    pub lease_manager: Arc<dyn LeaseManager>,
    /// The applier that unpacks layer blobs onto mounts.
    pub applier: Arc<dyn LayerApplier>,
    /// The key-value store backing record metadata.
    pub kv_store: Arc<dyn KvStore>,
    /// Optional factory for the external ref checker consulted by prune.
    pub ref_checker: Option<ExternalRefCheckerFn>,
}

/// Per-call options recognized by the manager's accessors.
#[derive(Default, Clone)]
pub struct RefOptions {
    /// Human-readable description stored on new records.
    pub description: Option<String>,
    /// Record classification for prune policy.
    pub record_type: Option<RecordType>,
    /// Overrides the creation time of new records.
    pub creation_time: Option<SystemTime>,
    /// Image references to append to the record.
    pub image_refs: Vec<String>,
    /// Retention policy for new records.
    pub cache_policy: Option<CachePolicy>,
    /// Suppresses last-used tracking for the returned handle.
    pub no_update_last_used: bool,
    /// Descriptor handlers for lazy blobs, inherited through parents.
    pub desc_handlers: DescHandlers,
}

pub(crate) struct ManagerInner {
    pub(crate) records: Mutex<HashMap<String, Arc<CacheRecord>>>,
    pub(crate) snapshotter: Arc<MergeSnapshotter>,
    pub(crate) content: Arc<dyn ContentStore>,
    pub(crate) leases: Arc<dyn LeaseManager>,
    pub(crate) applier: Arc<dyn LayerApplier>,
    pub(crate) store: MetadataStore,
    pub(crate) unlazy_g: Group<()>,
    pub(crate) size_g: Group<i64>,
    pub(crate) mu_prune: Mutex<()>,
    pub(crate) ref_checker: Option<ExternalRefCheckerFn>,
}

/// The layered cache manager.
pub struct CacheManager {
    pub(crate) inner: Arc<ManagerInner>,
}

type Records = HashMap<String, Arc<CacheRecord>>;

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl CacheManager {
    /// Builds a manager and restores all records from metadata. Records
    /// that can no longer be loaded are discarded together with their
    /// leases; records marked deleted complete their removal.
    pub fn new(opt: ManagerOpt) -> CacheResult<CacheManager> {
        let inner = Arc::new(ManagerInner {
            records: Mutex::new(HashMap::new()),
            snapshotter: opt.snapshotter,
            content: opt.content_store,
            leases: opt.lease_manager,
            applier: opt.applier,
            store: MetadataStore::new(opt.kv_store),
            unlazy_g: Group::new(),
            size_g: Group::new(),
            mu_prune: Mutex::new(()),
            ref_checker: opt.ref_checker,
        });
        let cm = CacheManager { inner };
        cm.init()?;
        Ok(cm)
    }

    fn init(&self) -> CacheResult<()> {
        let ids = self.inner.store.all_ids()?;
        let mut records = self.inner.lock_records();
        let mut restored = 0usize;
        for id in ids {
            match self.inner.get_record(&mut records, &id, &RefOptions::default()) {
                Ok(rec) => {
                    self.recover_snapshot_state(&mut records, &rec)?;
                    restored += 1;
                }
                Err(e) => {
                    debug!(id = %id, error = %e, "could not load cache record, discarding");
                    let _ = self.inner.store.clear(&id);
                    let _ = self.inner.leases.delete(&id);
                }
            }
        }
        info!(records = restored, "cache manager initialized");
        Ok(())
    }

    /// Discards (or re-lazifies) layer records whose unpacked snapshot went
    /// missing while the process was down.
    fn recover_snapshot_state(
        &self,
        records: &mut Records,
        rec: &Arc<CacheRecord>,
    ) -> CacheResult<()> {
        if rec.mutable || !matches!(rec.kind(), RecordKind::Layer | RecordKind::BaseLayer) {
            return Ok(());
        }
        let has_twin = {
            let g = rec.lock();
            g.equal_mutable.is_some()
        };
        if has_twin || rec.meta.get_blob_only()?.unwrap_or(false) {
            return Ok(());
        }
        if self.inner.snapshotter.stat(&rec.snapshot_id()?).is_ok() {
            return Ok(());
        }
        let has_blob = match rec.meta.get_blob()? {
            Some(blob) => self.inner.content.info(&blob).is_ok(),
            None => false,
        };
        if has_blob {
            debug!(id = %rec.id, "snapshot missing, reverting record to lazy");
            rec.meta.queue_blob_only(&true)?;
            rec.meta.queue_size(crate::metadata::SIZE_UNKNOWN)?;
            rec.meta.commit_metadata()?;
        } else {
            debug!(id = %rec.id, "snapshot and blob missing, discarding record");
            rec.remove(&self.inner, records, true)?;
        }
        Ok(())
    }

    /// Returns an immutable reference for `id`, loading the record from
    /// metadata if it is not resident.
    pub fn get(&self, id: &str, opts: &RefOptions) -> CacheResult<ImmutableRef> {
        let mut records = self.inner.lock_records();
        self.inner.get_inner(&mut records, id, opts)
    }

    /// Returns a content-addressed layer record for `desc` atop `parent`,
    /// reusing an existing record when the chain identity matches.
    pub fn get_by_blob(
        &self,
        desc: &Descriptor,
        parent: Option<&ImmutableRef>,
        opts: &RefOptions,
    ) -> CacheResult<ImmutableRef> {
        let diff_id = desc.uncompressed_digest().ok_or_else(|| CacheError::Invalid {
            reason: format!("missing uncompressed annotation for {}", desc.digest),
        })?;
        let mut chain_id = diff_id.clone();
        let mut blob_chain_id = Digest::chain(&desc.digest, &diff_id);

        if !opts.desc_handlers.contains_key(&desc.digest) {
            match self.inner.content.info(&desc.digest) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    return Err(CacheError::NeedsRemoteProviders(vec![desc.digest.clone()]))
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut p: Option<ImmutableRef> = None;
        if let Some(parent) = parent {
            let parent_opts = RefOptions { no_update_last_used: true, ..opts.clone() };
            let parent_ref = self.get(parent.id(), &parent_opts)?;
            if let Err(e) = parent_ref.finalize() {
                let _ = parent_ref.release();
                return Err(e);
            }
            match (parent_ref.chain_id()?, parent_ref.blob_chain_id()?) {
                (Some(pc), Some(pbc)) => {
                    chain_id = Digest::chain(&pc, &chain_id);
                    blob_chain_id = Digest::chain(&pbc, &blob_chain_id);
                }
                _ => {
                    let _ = parent_ref.release();
                    return Err(CacheError::Invalid {
                        reason: "failed to get ref by blob on non-addressable parent".to_string(),
                    });
                }
            }
            p = Some(parent_ref);
        }

        let mut records = self.inner.lock_records();
        let result = self.get_by_blob_locked(
            &mut records,
            desc,
            &diff_id,
            &chain_id,
            &blob_chain_id,
            &mut p,
            opts,
        );
        if let Some(parent_ref) = p {
            // either an error occurred or an existing record was reused;
            // the parent reference is not needed in both cases
            self.inner.release_ref_locked(&mut records, parent_ref);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn get_by_blob_locked(
        &self,
        records: &mut Records,
        desc: &Descriptor,
        diff_id: &Digest,
        chain_id: &Digest,
        blob_chain_id: &Digest,
        p: &mut Option<ImmutableRef>,
        opts: &RefOptions,
    ) -> CacheResult<ImmutableRef> {
        // exact blob match first
        for id in self.inner.store.search_blob_chain(blob_chain_id)? {
            match self.inner.get_inner(records, &id, opts) {
                Ok(r) => {
                    set_image_ref_metadata(&r.rec.meta, opts)?;
                    return Ok(r);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        // same logical layer under a different compression; its snapshot
        // (and laziness) carry over
        let mut link: Option<ImmutableRef> = None;
        for id in self.inner.store.search_chain(chain_id)? {
            match self.inner.get_inner(records, &id, opts) {
                Ok(r) => {
                    link = Some(r);
                    break;
                }
                Err(e) if e.is_not_found() || e.needs_remote_providers() => continue,
                Err(e) => return Err(e),
            }
        }

        let id = new_id();
        let (snapshot_id, blob_only) = match &link {
            Some(l) => (l.rec.snapshot_id()?, l.rec.meta.get_blob_only()?.unwrap_or(false)),
            None => (chain_id.to_string(), true),
        };
        if let Some(l) = link.take() {
            self.inner.release_ref_locked(records, l);
        }

        self.inner
            .leases
            .create(&id, flat_lease_labels())
            .map_err(CacheError::from)?;

        let build = |records: &mut Records, p: &mut Option<ImmutableRef>| -> CacheResult<ImmutableRef> {
            match self.inner.leases.add_resource(
                &id,
                Resource {
                    id: snapshot_id.clone(),
                    kind: format!("snapshots/{}", self.inner.snapshotter.name()),
                },
            ) {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
            self.inner.leases.add_resource(
                &id,
                Resource { id: desc.digest.to_string(), kind: "content".to_string() },
            )?;

            let md = self.inner.store.metadata(&id);
            let parents = match p.take() {
                Some(parent_ref) => ParentRefs::Layer(parent_ref),
                None => ParentRefs::None,
            };
            let rec = Arc::new(CacheRecord::new(
                id.clone(),
                false,
                Arc::downgrade(&self.inner),
                md,
                parents,
            ));

            initialize_metadata(&rec.meta, &rec.parents, None, opts)?;
            set_image_ref_metadata(&rec.meta, opts)?;

            rec.meta.queue_diff_id(diff_id)?;
            rec.meta.queue_blob(&desc.digest)?;
            rec.meta.queue_chain_id(chain_id)?;
            rec.meta.queue_blob_chain_id(blob_chain_id)?;
            rec.meta.queue_snapshot_id(&snapshot_id)?;
            rec.meta.queue_blob_only(&blob_only)?;
            rec.meta.queue_media_type(&desc.media_type)?;
            rec.meta.queue_blob_size(&desc.size)?;
            rec.meta.queue_committed(&true)?;
            rec.meta.commit_metadata()?;

            records.insert(id.clone(), rec.clone());
            debug!(id = %id, chain = %chain_id, blob_only, "created layer record from blob");

            let mut g = rec.lock();
            Ok(new_immutable(&rec, &mut g, true, opts.desc_handlers.clone()))
        };

        match build(records, p) {
            Ok(r) => Ok(r),
            Err(e) => {
                let _ = self.inner.leases.delete(&id);
                Err(e)
            }
        }
    }

    /// Creates a new mutable record, optionally atop a finalized, extracted
    /// parent.
    pub fn new_mutable(
        &self,
        cancel: &CancelToken,
        parent: Option<&ImmutableRef>,
        opts: &RefOptions,
    ) -> CacheResult<MutableRef> {
        let id = new_id();

        let mut parent_ref: Option<ImmutableRef> = None;
        let mut parent_snapshot = String::new();
        if let Some(parent) = parent {
            let p = parent.clone_ref();
            let prepare_parent = || -> CacheResult<String> {
                p.finalize()?;
                p.extract(cancel)?;
                p.rec.snapshot_id()
            };
            match prepare_parent() {
                Ok(snap) => parent_snapshot = snap,
                Err(e) => {
                    let _ = p.release();
                    return Err(e);
                }
            }
            parent_ref = Some(p);
        }

        let cleanup_parent = |p: Option<ImmutableRef>| {
            if let Some(p) = p {
                let _ = p.release();
            }
        };

        if let Err(e) = self.inner.leases.create(&id, flat_lease_labels()) {
            cleanup_parent(parent_ref);
            return Err(e.into());
        }

        let build = |parent_ref: &mut Option<ImmutableRef>| -> CacheResult<MutableRef> {
            match self.inner.leases.add_resource(
                &id,
                Resource {
                    id: id.clone(),
                    kind: format!("snapshots/{}", self.inner.snapshotter.name()),
                },
            ) {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }

            match &*parent_ref {
                Some(p) => {
                    crate::lazy::with_remote_snapshot_labels(
                        &self.inner,
                        &p.rec,
                        &p.desc_handlers,
                        || {
                            self.inner
                                .snapshotter
                                .prepare(&id, &parent_snapshot, HashMap::new())
                                .map_err(CacheError::from)
                        },
                    )?;
                }
                None => {
                    self.inner.snapshotter.prepare(&id, "", HashMap::new())?;
                }
            }

            let mut records = self.inner.lock_records();
            let md = self.inner.store.metadata(&id);
            let dhs = parent_ref
                .as_ref()
                .map(|p| p.desc_handlers.clone())
                .unwrap_or_else(|| opts.desc_handlers.clone());
            let parents = match parent_ref.take() {
                Some(p) => ParentRefs::Layer(p),
                None => ParentRefs::None,
            };
            let rec = Arc::new(CacheRecord::new(
                id.clone(),
                true,
                Arc::downgrade(&self.inner),
                md,
                parents,
            ));
            if let Err(e) = initialize_metadata(&rec.meta, &rec.parents, Some(&id), opts)
                .and_then(|_| set_image_ref_metadata(&rec.meta, opts))
            {
                let _ = rec.parents.release(&self.inner, &mut records);
                return Err(e);
            }
            records.insert(id.clone(), rec.clone());
            debug!(id = %id, parent = %parent_snapshot, "created mutable record");

            let mut g = rec.lock();
            Ok(new_mutable(&rec, &mut g, true, dhs))
        };

        match build(&mut parent_ref) {
            Ok(r) => Ok(r),
            Err(e) => {
                cleanup_parent(parent_ref);
                let _ = self.inner.leases.delete(&id);
                Err(e)
            }
        }
    }

    /// Returns a mutable handle for `id`. Fails with `Locked` while other
    /// handles exist; an unreferenced immutable twin is removed first.
    pub fn get_mutable(&self, id: &str, opts: &RefOptions) -> CacheResult<MutableRef> {
        let mut records = self.inner.lock_records();
        let rec = self.inner.get_record(&mut records, id, opts)?;
        let mut g = rec.lock();

        if !rec.mutable {
            return Err(CacheError::Invalid { reason: format!("{} is not mutable", id) });
        }
        if !rec.state(&g).refs.is_empty() {
            return Err(CacheError::Locked { id: id.to_string() });
        }
        if let Some(immutable) = g.equal_immutable.clone() {
            if !immutable.state(&g).refs.is_empty() {
                return Err(CacheError::Locked { id: id.to_string() });
            }
            immutable.remove(&self.inner, &mut records, false)?;
            g.equal_immutable = None;
            g.immutable = RecordState::default();
        }

        Ok(new_mutable(&rec, &mut g, true, opts.desc_handlers.clone()))
    }

    /// Builds a merge record from `parents`, flattening nested merges.
    /// A merge of nothing is nothing, and a merge of one thing is that
    /// thing. Snapshot creation is deferred until the record is extracted.
    pub fn merge(
        &self,
        parents: &[ImmutableRef],
        opts: &RefOptions,
    ) -> CacheResult<Option<ImmutableRef>> {
        let mut merged: Vec<ImmutableRef> = Vec::new();
        let mut dhs: DescHandlers = HashMap::new();
        for parent in parents {
            match &parent.rec.parents {
                ParentRefs::Merge(ps) => {
                    // merges are never nested: splice in the components
                    for gp in ps {
                        merged.push(gp.clone_ref());
                    }
                }
                _ => merged.push(parent.clone_ref()),
            }
            for (k, v) in &parent.desc_handlers {
                dhs.insert(k.clone(), v.clone());
            }
        }

        if merged.is_empty() {
            return Ok(None);
        }
        if merged.len() == 1 {
            return Ok(Some(merged.pop().expect("length checked")));
        }

        for p in &merged {
            if let Err(e) = p.finalize() {
                let _ = release_refs(merged);
                return Err(e);
            }
        }

        let id = new_id();
        let mut records = self.inner.lock_records();
        let md = self.inner.store.metadata(&id);
        let rec = Arc::new(CacheRecord::new(
            id.clone(),
            false,
            Arc::downgrade(&self.inner),
            md,
            ParentRefs::Merge(merged),
        ));

        let build = |records: &mut Records| -> CacheResult<ImmutableRef> {
            initialize_metadata(&rec.meta, &rec.parents, None, opts)?;
            self.inner.leases.create(&id, flat_lease_labels())?;
            if let Err(e) = self.inner.leases.add_resource(
                &id,
                Resource {
                    id: id.clone(),
                    kind: format!("snapshots/{}", self.inner.snapshotter.name()),
                },
            ) {
                let _ = self.inner.leases.delete(&id);
                return Err(e.into());
            }
            rec.meta.queue_snapshot_id(&id)?;
            rec.meta.queue_committed(&true)?;
            rec.meta.commit_metadata()?;
            records.insert(id.clone(), rec.clone());
            debug!(id = %id, parents = match &rec.parents { ParentRefs::Merge(ps) => ps.len(), _ => 0 }, "created merge record");

            let mut g = rec.lock();
            Ok(new_immutable(&rec, &mut g, true, dhs.clone()))
        };

        match build(&mut records) {
            Ok(r) => Ok(Some(r)),
            Err(e) => {
                let _ = self.inner.leases.delete(&id);
                let _ = rec.parents.release(&self.inner, &mut records);
                Err(e)
            }
        }
    }

    /// Builds a diff record over a lower/upper pair; either side may be
    /// absent, but not both. Snapshot creation is deferred until the record
    /// is extracted.
    pub fn diff(
        &self,
        lower: Option<&ImmutableRef>,
        upper: Option<&ImmutableRef>,
        opts: &RefOptions,
    ) -> CacheResult<ImmutableRef> {
        if lower.is_none() && upper.is_none() {
            return Err(CacheError::Invalid {
                reason: "diff requires a lower or an upper ref".to_string(),
            });
        }

        let mut dhs: DescHandlers = HashMap::new();
        for side in [lower, upper].into_iter().flatten() {
            for (k, v) in &side.desc_handlers {
                dhs.insert(k.clone(), v.clone());
            }
        }

        let l = lower.map(|r| r.clone_ref());
        let u = upper.map(|r| r.clone_ref());
        let mut finalize_err = None;
        for side in l.iter().chain(u.iter()) {
            if let Err(e) = side.finalize() {
                finalize_err = Some(e);
                break;
            }
        }
        if let Some(e) = finalize_err {
            let _ = release_refs(l.into_iter().chain(u).collect());
            return Err(e);
        }

        let id = new_id();
        let mut records = self.inner.lock_records();
        let md = self.inner.store.metadata(&id);
        let rec = Arc::new(CacheRecord::new(
            id.clone(),
            false,
            Arc::downgrade(&self.inner),
            md,
            ParentRefs::Diff { lower: l, upper: u },
        ));

        let build = |records: &mut Records| -> CacheResult<ImmutableRef> {
            initialize_metadata(&rec.meta, &rec.parents, None, opts)?;
            self.inner.leases.create(&id, flat_lease_labels())?;
            if let Err(e) = self.inner.leases.add_resource(
                &id,
                Resource {
                    id: id.clone(),
                    kind: format!("snapshots/{}", self.inner.snapshotter.name()),
                },
            ) {
                let _ = self.inner.leases.delete(&id);
                return Err(e.into());
            }
            rec.meta.queue_snapshot_id(&id)?;
            rec.meta.queue_committed(&true)?;
            rec.meta.commit_metadata()?;
            records.insert(id.clone(), rec.clone());
            debug!(id = %id, "created diff record");

            let mut g = rec.lock();
            Ok(new_immutable(&rec, &mut g, true, dhs.clone()))
        };

        match build(&mut records) {
            Ok(r) => Ok(r),
            Err(e) => {
                let _ = self.inner.leases.delete(&id);
                let _ = rec.parents.release(&self.inner, &mut records);
                Err(e)
            }
        }
    }

    /// Shuts the manager down. Outstanding handles become unusable.
    pub fn close(&self) -> CacheResult<()> {
        debug!("closing cache manager");
        Ok(())
    }
}

impl ManagerInner {
    pub(crate) fn lock_records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Releases a handle while the manager lock is already held.
    pub(crate) fn release_ref_locked(&self, records: &mut Records, r: ImmutableRef) {
        let rec = r.rec.clone();
        let mut g = rec.lock();
        if let Err(e) = r.release_locked(self, records, &mut g) {
            debug!(id = %rec.id, error = %e, "failed to release reference");
        }
    }

    /// Returns an immutable ref for `id`. A mutable record with an existing
    /// immutable twin yields the twin; a mutable record without one is
    /// implicitly committed. Requires the manager lock.
    pub(crate) fn get_inner(
        self: &Arc<Self>,
        records: &mut Records,
        id: &str,
        opts: &RefOptions,
    ) -> CacheResult<ImmutableRef> {
        let rec = self.get_record(records, id, opts)?;
        let mut g = rec.lock();
        let trigger = !opts.no_update_last_used;

        if rec.mutable {
            if !rec.state(&g).refs.is_empty() {
                return Err(CacheError::Locked { id: id.to_string() });
            }
            if let Some(immutable) = g.equal_immutable.clone() {
                return Ok(new_immutable(&immutable, &mut g, trigger, opts.desc_handlers.clone()));
            }
            // the mutable handle created here is retained as the twin link
            let _mref = new_mutable(&rec, &mut g, trigger, opts.desc_handlers.clone());
            return commit_locked(self, records, &rec, &mut g, trigger, opts.desc_handlers.clone());
        }

        Ok(new_immutable(&rec, &mut g, trigger, opts.desc_handlers.clone()))
    }

    /// Returns the record for `id`, loading it from metadata if needed.
    /// Requires the manager lock.
    pub(crate) fn get_record(
        self: &Arc<Self>,
        records: &mut Records,
        id: &str,
        opts: &RefOptions,
    ) -> CacheResult<Arc<CacheRecord>> {
        if let Some(rec) = records.get(id).cloned() {
            {
                let g = rec.lock();
                if rec.is_dead_locked(&g) {
                    return Err(CacheError::NotFound { id: id.to_string() });
                }
            }
            self.check_lazy_providers(&rec, &opts.desc_handlers)?;
            return Ok(rec);
        }

        if !self.store.exists(id)? {
            return Err(CacheError::NotFound { id: id.to_string() });
        }
        let md = self.store.metadata(id);
        let parents = self.parents_of(records, &md, opts)?;

        if let Some(mutable_id) = md.get_equal_mutable()? {
            let mutable = match self.get_record(records, &mutable_id, &RefOptions::default()) {
                Ok(m) => m,
                Err(e) => {
                    if e.is_not_found() {
                        // the mutable side is gone; this half is unusable
                        let _ = self.store.clear(id);
                    }
                    let _ = parents.release(self, records);
                    return Err(e);
                }
            };
            let rec = Arc::new(CacheRecord::new_paired(
                id.to_string(),
                false,
                Arc::downgrade(self),
                md,
                parents,
                &mutable,
            ));
            {
                let mut g = rec.lock();
                g.immutable = RecordState::default();
                g.equal_immutable = Some(rec.clone());
                g.equal_mutable = Some(mutable.clone());
            }
            records.insert(id.to_string(), rec.clone());
            return Ok(rec);
        }

        let mutable = !md.get_committed()?.unwrap_or(false);
        let rec = Arc::new(CacheRecord::new(
            id.to_string(),
            mutable,
            Arc::downgrade(self),
            md,
            parents,
        ));

        // removal was started but the process crashed before finishing
        if rec.meta.get_deleted()?.unwrap_or(false) {
            rec.remove(self, records, true)?;
            return Err(CacheError::NotFound { id: id.to_string() });
        }

        let setup = || -> CacheResult<()> {
            initialize_metadata(&rec.meta, &rec.parents, None, opts)?;
            set_image_ref_metadata(&rec.meta, opts)
        };
        if let Err(e) = setup() {
            let _ = rec.parents.release(self, records);
            return Err(e);
        }

        records.insert(id.to_string(), rec.clone());
        self.check_lazy_providers(&rec, &opts.desc_handlers)?;
        Ok(rec)
    }

    /// Verifies every lazy ancestor has a descriptor handler installed.
    fn check_lazy_providers(
        &self,
        rec: &Arc<CacheRecord>,
        dhs: &DescHandlers,
    ) -> CacheResult<()> {
        let mut missing: Vec<Digest> = Vec::new();
        walk_unique_ancestors(rec, &mut |r| {
            if r.is_lazy(self)? {
                if let Some(blob) = r.meta.get_blob()? {
                    if !dhs.contains_key(&blob) {
                        missing.push(blob);
                    }
                }
            }
            Ok(())
        })?;
        if missing.is_empty() {
            Ok(())
        } else {
            missing.sort();
            Err(CacheError::NeedsRemoteProviders(missing))
        }
    }

    /// Loads the owning parent references recorded in metadata.
    fn parents_of(
        self: &Arc<Self>,
        records: &mut Records,
        md: &CacheMetadata,
        opts: &RefOptions,
    ) -> CacheResult<ParentRefs> {
        let child_opts = RefOptions { no_update_last_used: true, ..opts.clone() };

        if let Some(parent_id) = md.get_parent()? {
            let p = self.get_inner(records, &parent_id, &child_opts)?;
            return Ok(ParentRefs::Layer(p));
        }

        if let Some(ids) = md.get_merge_parents()? {
            if !ids.is_empty() {
                let mut ps: Vec<ImmutableRef> = Vec::new();
                for pid in &ids {
                    match self.get_inner(records, pid, &child_opts) {
                        Ok(p) => ps.push(p),
                        Err(e) => {
                            let partial = ParentRefs::Merge(ps);
                            let _ = partial.release(self, records);
                            return Err(e);
                        }
                    }
                }
                return Ok(ParentRefs::Merge(ps));
            }
        }

        let lower_id = md.get_diff_lower()?;
        let upper_id = md.get_diff_upper()?;
        if lower_id.is_some() || upper_id.is_some() {
            let mut lower = None;
            if let Some(lid) = &lower_id {
                lower = Some(self.get_inner(records, lid, &child_opts)?);
            }
            let upper = match &upper_id {
                Some(uid) => match self.get_inner(records, uid, &child_opts) {
                    Ok(u) => Some(u),
                    Err(e) => {
                        let partial = ParentRefs::Diff { lower, upper: None };
                        let _ = partial.release(self, records);
                        return Err(e);
                    }
                },
                None => None,
            };
            return Ok(ParentRefs::Diff { lower, upper });
        }

        Ok(ParentRefs::None)
    }
}

/// Seeds the persisted metadata of a freshly created (or first-loaded)
/// record. A record that already has a creation time is left untouched.
pub(crate) fn initialize_metadata(
    md: &CacheMetadata,
    parents: &ParentRefs,
    snapshot_id: Option<&str>,
    opts: &RefOptions,
) -> CacheResult<()> {
    if md.get_created_at()?.is_some() {
        return Ok(());
    }

    match parents {
        ParentRefs::Layer(p) => md.queue_parent(&p.rec.id)?,
        ParentRefs::Merge(ps) => {
            let ids: Vec<String> = ps.iter().map(|p| p.rec.id.clone()).collect();
            md.queue_merge_parents(&ids)?;
        }
        ParentRefs::Diff { lower, upper } => {
            if let Some(l) = lower {
                md.queue_diff_lower(&l.rec.id)?;
            }
            if let Some(u) = upper {
                md.queue_diff_upper(&u.rec.id)?;
            }
        }
        ParentRefs::None => {}
    }

    md.queue_created_at(opts.creation_time.unwrap_or_else(SystemTime::now))?;
    if let Some(d) = &opts.description {
        md.queue_description(d)?;
    }
    if let Some(rt) = opts.record_type {
        md.queue_record_type(&rt)?;
    }
    if let Some(cp) = opts.cache_policy {
        md.queue_cache_policy(&cp)?;
    }
    if let Some(sid) = snapshot_id {
        md.queue_snapshot_id(&sid.to_string())?;
    }
    md.commit_metadata()
}

/// Applies the image-ref options, which append even to reused records.
pub(crate) fn set_image_ref_metadata(md: &CacheMetadata, opts: &RefOptions) -> CacheResult<()> {
    for image_ref in &opts.image_refs {
        md.append_image_ref(image_ref)?;
    }
    md.commit_metadata()
}
