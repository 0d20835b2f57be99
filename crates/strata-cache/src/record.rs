//! Cache records: the nodes of the layer DAG.
//!
//! A record owns one snapshot (possibly not yet materialized), its persisted
//! metadata, and owning references to its parents. A mutable record and the
//! immutable record committed from it form an equal pair sharing one
//! underlying snapshot; the pair shares a single mutex, so holding a
//! record's lock pins both sides.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use strata_snapshot::{
    flat_lease_labels, ContentStore, Digest, LeaseManager, Mount, Resource, Snapshotter,
};

use crate::error::{CacheError, CacheResult};
use crate::lazy::REMOTE_SNAPSHOT_LABEL;
use crate::manager::ManagerInner;
use crate::metadata::{CacheMetadata, SIZE_UNKNOWN};
use crate::refs::ImmutableRef;

/// The kind of a record, determined by its parent relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// No parents.
    BaseLayer,
    /// Exactly one layer parent.
    Layer,
    /// Two or more merge parents.
    Merge,
    /// A lower/upper diff pair.
    Diff,
}

/// Which side of a (possibly paired) record this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TwinSide {
    Mutable,
    Immutable,
}

/// Volatile per-record state, guarded by the shared twin mutex.
#[derive(Default)]
pub(crate) struct RecordState {
    /// Live handles: handle id -> tracks-last-used flag.
    pub refs: HashMap<u64, bool>,
    /// Set at the start of removal; prevents new handles.
    pub dead: bool,
    /// Cached mounts, invalidated when the last handle goes away.
    pub mount_cache: Option<Vec<Mount>>,
    /// Cached layer digest chain.
    pub chain_cache: Option<Vec<Digest>>,
}

/// Shared state of an equal pair (or a standalone record).
///
/// Both sides of a pair point at the same `TwinState`, which is what makes
/// the shared-mutex invariant hold.
#[derive(Default)]
pub(crate) struct TwinState {
    pub mutable: RecordState,
    pub immutable: RecordState,
    /// The mutable side of the pair, if it exists.
    pub equal_mutable: Option<Arc<CacheRecord>>,
    /// The immutable side of the pair, if it exists.
    pub equal_immutable: Option<Arc<CacheRecord>>,
    /// Deferred last-used trigger carried over to the mutable side.
    pub mutable_trigger: bool,
}

impl TwinState {
    fn side(&self, side: TwinSide) -> &RecordState {
        match side {
            TwinSide::Mutable => &self.mutable,
            TwinSide::Immutable => &self.immutable,
        }
    }

    fn side_mut(&mut self, side: TwinSide) -> &mut RecordState {
        match side {
            TwinSide::Mutable => &mut self.mutable,
            TwinSide::Immutable => &mut self.immutable,
        }
    }
}

/// One node of the cache DAG.
pub(crate) struct CacheRecord {
    pub(crate) id: String,
    pub(crate) mutable: bool,
    pub(crate) cm: Weak<ManagerInner>,
    pub(crate) meta: CacheMetadata,
    pub(crate) parents: ParentRefs,
    pub(crate) twin: Arc<Mutex<TwinState>>,
    pub(crate) side: TwinSide,
    removed: AtomicBool,
}

impl CacheRecord {
    pub(crate) fn new(
        id: String,
        mutable: bool,
        cm: Weak<ManagerInner>,
        meta: CacheMetadata,
        parents: ParentRefs,
    ) -> CacheRecord {
        CacheRecord {
            id,
            mutable,
            cm,
            meta,
            parents,
            twin: Arc::new(Mutex::new(TwinState::default())),
            side: if mutable { TwinSide::Mutable } else { TwinSide::Immutable },
            removed: AtomicBool::new(false),
        }
    }

    /// A record sharing the twin state (and therefore the lock) of `other`.
    pub(crate) fn new_paired(
        id: String,
        mutable: bool,
        cm: Weak<ManagerInner>,
        meta: CacheMetadata,
        parents: ParentRefs,
        other: &CacheRecord,
    ) -> CacheRecord {
        CacheRecord {
            id,
            mutable,
            cm,
            meta,
            parents,
            twin: other.twin.clone(),
            side: if mutable { TwinSide::Mutable } else { TwinSide::Immutable },
            removed: AtomicBool::new(false),
        }
    }

    /// Locks the shared twin state. Holding the guard pins both sides of an
    /// equal pair.
    pub(crate) fn lock(&self) -> MutexGuard<'_, TwinState> {
        self.twin.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state<'a>(&self, g: &'a TwinState) -> &'a RecordState {
        g.side(self.side)
    }

    pub(crate) fn state_mut<'a>(&self, g: &'a mut TwinState) -> &'a mut RecordState {
        g.side_mut(self.side)
    }

    /// Upgrades the manager back-reference.
    pub(crate) fn cm(&self) -> CacheResult<Arc<ManagerInner>> {
        self.cm.upgrade().ok_or_else(|| CacheError::Invalid {
            reason: "cache manager is closed".to_string(),
        })
    }

    pub(crate) fn kind(&self) -> RecordKind {
        self.parents.kind()
    }

    /// Requires the twin lock.
    pub(crate) fn is_dead_locked(&self, g: &TwinState) -> bool {
        self.state(g).dead
            || (g.equal_immutable.is_some() && g.immutable.dead)
            || (g.equal_mutable.is_some() && g.mutable.dead)
    }

    pub(crate) fn snapshot_id(&self) -> CacheResult<String> {
        Ok(self.meta.get_snapshot_id()?.unwrap_or_else(|| self.id.clone()))
    }

    pub(crate) fn view_lease_id(&self) -> String {
        format!("{}-view", self.id)
    }

    pub(crate) fn view_snapshot_id(&self) -> CacheResult<String> {
        Ok(format!("{}-view", self.snapshot_id()?))
    }

    /// A record is lazy when only its blob metadata exists: the snapshot is
    /// absent (or remote) and the blob bytes may not be local yet.
    pub(crate) fn is_lazy(&self, cm: &ManagerInner) -> CacheResult<bool> {
        if !self.meta.get_blob_only()?.unwrap_or(false) {
            return Ok(false);
        }
        let blob = match self.meta.get_blob()? {
            Some(b) => b,
            None => return Ok(false),
        };
        match cm.content.info(&blob) {
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }
        if let Ok(info) = cm.snapshotter.stat(&self.snapshot_id()?) {
            if info.labels.contains_key(REMOTE_SNAPSHOT_LABEL) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns mounts for this record, caching them. Requires the twin lock.
    pub(crate) fn mount_locked(
        self: &Arc<Self>,
        cm: &ManagerInner,
        g: &mut TwinState,
    ) -> CacheResult<Vec<Mount>> {
        if let Some(mounts) = &self.state(g).mount_cache {
            return Ok(mounts.clone());
        }

        let mount_snapshot_id;
        if self.mutable {
            mount_snapshot_id = self.snapshot_id()?;
        } else if let Some(mutable) = &g.equal_mutable {
            mount_snapshot_id = mutable.snapshot_id()?;
        } else {
            // committed records are mounted through an ephemeral view kept
            // alive by its own lease until the last handle is released
            mount_snapshot_id = self.view_snapshot_id()?;
            match cm.leases.create(&self.view_lease_id(), flat_lease_labels()) {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
            let cleanup = |cm: &ManagerInner, id: &str| {
                let _ = cm.leases.delete(id);
            };
            match cm.leases.add_resource(
                &self.view_lease_id(),
                Resource {
                    id: mount_snapshot_id.clone(),
                    kind: format!("snapshots/{}", cm.snapshotter.name()),
                },
            ) {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => {
                    cleanup(cm, &self.view_lease_id());
                    return Err(e.into());
                }
            }
            match cm.snapshotter.view(&mount_snapshot_id, &self.snapshot_id()?) {
                Ok(mounts) => {
                    self.state_mut(g).mount_cache = Some(mounts.clone());
                    return Ok(mounts);
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => {
                    cleanup(cm, &self.view_lease_id());
                    return Err(e.into());
                }
            }
        }

        let mounts = cm.snapshotter.mounts(&mount_snapshot_id)?;
        self.state_mut(g).mount_cache = Some(mounts.clone());
        Ok(mounts)
    }

    /// Computes (and caches) the record's total size: snapshot usage plus
    /// blob sizes including compression variants. Single-flight per id.
    pub(crate) fn size(self: &Arc<Self>, cm: &Arc<ManagerInner>) -> CacheResult<i64> {
        let rec = self;
        let key = format!("size::{}", self.id);
        cm.size_g.do_call(&key, || {
            let (driver_id, blob_only) = {
                let g = rec.lock();
                let s = rec.meta.get_size()?;
                if s != SIZE_UNKNOWN {
                    return Ok(s);
                }
                let driver_id = match &g.equal_mutable {
                    Some(m) => m.snapshot_id()?,
                    None => rec.snapshot_id()?,
                };
                (driver_id, rec.meta.get_blob_only()?.unwrap_or(false))
            };

            let mut size: i64 = 0;
            if !blob_only {
                match cm.snapshotter.usage(&driver_id) {
                    Ok(usage) => size += usage.size,
                    Err(e) => {
                        let dead = {
                            let g = rec.lock();
                            rec.is_dead_locked(&g)
                        };
                        if dead {
                            return Ok(0);
                        }
                        if !e.is_not_found() {
                            return Err(e.into());
                        }
                    }
                }
            }

            if let Some(blob) = rec.meta.get_blob()? {
                if let Ok(info) = cm.content.info(&blob) {
                    size += info.size;
                    for (key, value) in &info.labels {
                        if !key.starts_with(crate::compression::VARIANT_DIGEST_LABEL_PREFIX) {
                            continue;
                        }
                        let Some(variant) = Digest::parse(value) else { continue };
                        if variant == blob {
                            // self-referential variant label, already counted
                            continue;
                        }
                        if let Ok(info) = cm.content.info(&variant) {
                            size += info.size;
                        }
                    }
                }
            }

            rec.meta.queue_size(size)?;
            rec.meta.commit_metadata()?;
            debug!(id = %rec.id, size, "computed record size");
            Ok(size)
        })
    }

    /// Destroys the record: lease (and with it the snapshot), metadata, and
    /// the owning references to its parents. Requires the manager lock;
    /// idempotent.
    pub(crate) fn remove(
        &self,
        cm: &ManagerInner,
        records: &mut HashMap<String, Arc<CacheRecord>>,
        remove_snapshot: bool,
    ) -> CacheResult<()> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        records.remove(&self.id);
        if remove_snapshot {
            match cm.leases.delete(&self.id) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        cm.store.clear(&self.id)?;
        self.parents.release(cm, records)?;
        debug!(id = %self.id, remove_snapshot, "removed cache record");
        Ok(())
    }
}

/// Control value for ancestor walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkControl {
    Continue,
    SkipParents,
}

/// Depth-first walk over a record and all its ancestors. Records reachable
/// through several paths are visited once per path unless the callback
/// returns [`WalkControl::SkipParents`].
pub(crate) fn walk_ancestors(
    start: &Arc<CacheRecord>,
    f: &mut dyn FnMut(&Arc<CacheRecord>) -> CacheResult<WalkControl>,
) -> CacheResult<()> {
    let mut stack = vec![start.clone()];
    while let Some(cur) = stack.pop() {
        if f(&cur)? == WalkControl::SkipParents {
            continue;
        }
        match &cur.parents {
            ParentRefs::Layer(p) => stack.push(p.rec.clone()),
            ParentRefs::Merge(ps) => {
                for p in ps {
                    stack.push(p.rec.clone());
                }
            }
            ParentRefs::Diff { lower, upper } => {
                if let Some(l) = lower {
                    stack.push(l.rec.clone());
                }
                if let Some(u) = upper {
                    stack.push(u.rec.clone());
                }
            }
            ParentRefs::None => {}
        }
    }
    Ok(())
}

/// Like [`walk_ancestors`] but visits each record at most once.
pub(crate) fn walk_unique_ancestors(
    start: &Arc<CacheRecord>,
    f: &mut dyn FnMut(&Arc<CacheRecord>) -> CacheResult<()>,
) -> CacheResult<()> {
    let mut seen = std::collections::HashSet::new();
    walk_ancestors(start, &mut |rec| {
        if !seen.insert(Arc::as_ptr(rec) as usize) {
            return Ok(WalkControl::SkipParents);
        }
        f(rec)?;
        Ok(WalkControl::Continue)
    })
}

/// Visits each record representing an actual layer in the chain for `rec`,
/// lowest to highest.
///
/// A diff whose upper is a single layer directly atop its lower re-emits
/// that layer; any other diff is emitted as a single synthesized layer.
pub(crate) fn layer_walk_records(rec: &Arc<CacheRecord>, f: &mut dyn FnMut(&Arc<CacheRecord>)) {
    match &rec.parents {
        ParentRefs::Merge(ps) => {
            for p in ps {
                layer_walk_records(&p.rec, f);
            }
        }
        ParentRefs::Diff { lower, upper } => match (lower, upper) {
            (None, Some(u)) if u.rec.kind() == RecordKind::BaseLayer => f(&u.rec),
            (Some(l), Some(u))
                if u.rec.kind() == RecordKind::Layer
                    && u.rec.parents.layer_parent_id() == Some(l.rec.id.as_str()) =>
            {
                f(&u.rec)
            }
            _ => f(rec),
        },
        ParentRefs::Layer(p) => {
            layer_walk_records(&p.rec, f);
            f(rec);
        }
        ParentRefs::None => f(rec),
    }
}

/// The blob digests of every layer in the record's chain, lowest to
/// highest, as consumed by the external ref checker.
pub(crate) fn layer_digest_chain(rec: &Arc<CacheRecord>) -> CacheResult<Vec<Digest>> {
    let mut g = rec.lock();
    layer_digest_chain_locked(rec, &mut g)
}

/// Requires the twin lock of `rec`.
pub(crate) fn layer_digest_chain_locked(
    rec: &Arc<CacheRecord>,
    g: &mut TwinState,
) -> CacheResult<Vec<Digest>> {
    if let Some(chain) = &rec.state(g).chain_cache {
        return Ok(chain.clone());
    }
    let mut chain = Vec::new();
    match &rec.parents {
        ParentRefs::Diff { upper, .. } => {
            if rec.meta.get_blob()?.is_none() {
                if let Some(u) = upper {
                    chain.extend(layer_digest_chain(&u.rec)?);
                }
            } else if let Some(blob) = rec.meta.get_blob()? {
                chain.push(blob);
            }
        }
        ParentRefs::Merge(ps) => {
            for p in ps {
                chain.extend(layer_digest_chain(&p.rec)?);
            }
        }
        ParentRefs::Layer(p) => {
            chain.extend(layer_digest_chain(&p.rec)?);
            if let Some(blob) = rec.meta.get_blob()? {
                chain.push(blob);
            }
        }
        ParentRefs::None => {
            if let Some(blob) = rec.meta.get_blob()? {
                chain.push(blob);
            }
        }
    }
    rec.state_mut(g).chain_cache = Some(chain.clone());
    Ok(chain)
}

/// The parent relation of a record: a disjoint union of the four kinds.
///
/// Parents are held through owning references; releasing a record releases
/// its parents transitively.
pub(crate) enum ParentRefs {
    None,
    Layer(ImmutableRef),
    Merge(Vec<ImmutableRef>),
    Diff {
        lower: Option<ImmutableRef>,
        upper: Option<ImmutableRef>,
    },
}

impl ParentRefs {
    pub(crate) fn kind(&self) -> RecordKind {
        match self {
            ParentRefs::None => RecordKind::BaseLayer,
            ParentRefs::Layer(_) => RecordKind::Layer,
            ParentRefs::Merge(_) => RecordKind::Merge,
            ParentRefs::Diff { .. } => RecordKind::Diff,
        }
    }

    pub(crate) fn layer_parent_id(&self) -> Option<&str> {
        match self {
            ParentRefs::Layer(p) => Some(&p.rec.id),
            _ => None,
        }
    }

    /// Releases every owned parent reference, locking each parent in turn.
    /// Requires the manager lock; failures are accumulated so one release
    /// error does not mask the others.
    pub(crate) fn release(
        &self,
        cm: &ManagerInner,
        records: &mut HashMap<String, Arc<CacheRecord>>,
    ) -> CacheResult<()> {
        let mut errors = Vec::new();
        let mut release_one = |p: &ImmutableRef| {
            let rec = p.rec.clone();
            let mut g = rec.lock();
            if let Err(e) = p.release_locked(cm, records, &mut g) {
                errors.push(e);
            }
        };
        match self {
            ParentRefs::None => {}
            ParentRefs::Layer(p) => release_one(p),
            ParentRefs::Merge(ps) => {
                for p in ps {
                    release_one(p);
                }
            }
            ParentRefs::Diff { lower, upper } => {
                if let Some(l) = lower {
                    release_one(l);
                }
                if let Some(u) = upper {
                    release_one(u);
                }
            }
        }
        match CacheError::join(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Clones every parent reference into a new owning set.
    pub(crate) fn clone_refs(&self) -> ParentRefs {
        match self {
            ParentRefs::None => ParentRefs::None,
            ParentRefs::Layer(p) => ParentRefs::Layer(p.clone_ref()),
            ParentRefs::Merge(ps) => {
                ParentRefs::Merge(ps.iter().map(|p| p.clone_ref()).collect())
            }
            ParentRefs::Diff { lower, upper } => ParentRefs::Diff {
                lower: lower.as_ref().map(|p| p.clone_ref()),
                upper: upper.as_ref().map(|p| p.clone_ref()),
            },
        }
    }
}
