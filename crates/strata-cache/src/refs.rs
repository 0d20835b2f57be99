//! Reference handles onto cache records.
//!
//! Handles implement the reference counting that keeps records alive.
//! Releasing the last handle of a non-retained record tears the record
//! down; an immutable handle can be cloned, finalized, extracted and
//! mounted, while a mutable handle is committed into an immutable twin.
//!
//! Handles are released explicitly; dropping one without calling
//! `release` leaks its count until the manager is restarted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use strata_snapshot::{
    flat_lease_labels, set_readonly, CancelToken, Descriptor, Digest, LeaseManager, Mount,
    Resource, Snapshotter,
};

use crate::compression;
use crate::desc::{DescHandler, DescHandlers};
use crate::error::{CacheError, CacheResult};
use crate::lazy;
use crate::manager::{initialize_metadata, ManagerInner, RefOptions};
use crate::metadata::SIZE_UNKNOWN;
use crate::record::{
    layer_walk_records, CacheRecord, RecordKind, RecordState, TwinState,
};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// An immutable, committed (or committable) reference to a cache record.
pub struct ImmutableRef {
    pub(crate) rec: Arc<CacheRecord>,
    pub(crate) handle: u64,
    pub(crate) trigger_last_used: bool,
    pub(crate) desc_handlers: DescHandlers,
}

impl std::fmt::Debug for ImmutableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmutableRef")
            .field("handle", &self.handle)
            .finish()
    }
}

/// A mutable reference exposing a writable working snapshot.
pub struct MutableRef {
    pub(crate) rec: Arc<CacheRecord>,
    pub(crate) handle: u64,
    pub(crate) trigger_last_used: bool,
    pub(crate) desc_handlers: DescHandlers,
}

impl std::fmt::Debug for MutableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableRef")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Registers a new immutable handle. Requires the twin lock.
pub(crate) fn new_immutable(
    rec: &Arc<CacheRecord>,
    g: &mut TwinState,
    trigger: bool,
    desc_handlers: DescHandlers,
) -> ImmutableRef {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    rec.state_mut(g).refs.insert(handle, trigger);
    ImmutableRef { rec: rec.clone(), handle, trigger_last_used: trigger, desc_handlers }
}

/// Registers a new mutable handle. Requires the twin lock.
pub(crate) fn new_mutable(
    rec: &Arc<CacheRecord>,
    g: &mut TwinState,
    trigger: bool,
    desc_handlers: DescHandlers,
) -> MutableRef {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    rec.state_mut(g).refs.insert(handle, trigger);
    MutableRef { rec: rec.clone(), handle, trigger_last_used: trigger, desc_handlers }
}

impl ImmutableRef {
    /// The record id.
    pub fn id(&self) -> &str {
        &self.rec.id
    }

    /// The record's kind.
    pub fn kind(&self) -> RecordKind {
        self.rec.kind()
    }

    /// The record's chain id, if addressable.
    pub fn chain_id(&self) -> CacheResult<Option<Digest>> {
        self.rec.meta.get_chain_id()
    }

    /// The record's blob chain id, if addressable.
    pub fn blob_chain_id(&self) -> CacheResult<Option<Digest>> {
        self.rec.meta.get_blob_chain_id()
    }

    /// The record's blob digest, if set.
    pub fn blob(&self) -> CacheResult<Option<Digest>> {
        self.rec.meta.get_blob()
    }

    /// The descriptor handler registered for `digest`, if any.
    pub fn desc_handler(&self, digest: &Digest) -> Option<Arc<DescHandler>> {
        self.desc_handlers.get(digest).cloned()
    }

    /// Returns a new handle on the same record without touching last-used
    /// tracking.
    pub fn clone_ref(&self) -> ImmutableRef {
        let mut g = self.rec.lock();
        new_immutable(&self.rec, &mut g, false, self.desc_handlers.clone())
    }

    /// The total size of the record, computing and caching it if unknown.
    pub fn size(&self) -> CacheResult<i64> {
        let cm = self.rec.cm()?;
        self.rec.size(&cm)
    }

    /// Handles onto every layer in this record's chain, lowest to highest.
    /// Each returned handle must be released.
    pub fn layer_chain(&self) -> Vec<ImmutableRef> {
        let mut out = Vec::new();
        layer_walk_records(&self.rec, &mut |rec| {
            let mut g = rec.lock();
            out.push(new_immutable(rec, &mut g, false, self.desc_handlers.clone()));
        });
        out
    }

    /// Releases this handle. The last release of a non-retained record
    /// starts its teardown.
    pub fn release(self) -> CacheResult<()> {
        let cm = self.rec.cm()?;
        let mut records = cm.records.lock().unwrap_or_else(|e| e.into_inner());
        let rec = self.rec.clone();
        let mut g = rec.lock();
        self.release_locked(&cm, &mut records, &mut g)
    }

    /// Requires the manager lock and the twin lock.
    pub(crate) fn release_locked(
        &self,
        cm: &ManagerInner,
        records: &mut HashMap<String, Arc<CacheRecord>>,
        g: &mut TwinState,
    ) -> CacheResult<()> {
        self.rec.state_mut(g).refs.remove(&self.handle);

        // last-used advances only when the final tracking handle goes away
        if self.trigger_last_used && !self.rec.state(g).refs.values().any(|t| *t) {
            self.rec.meta.update_last_used()?;
            if g.equal_mutable.is_some() {
                g.mutable_trigger = true;
            }
        }

        if self.rec.state(g).refs.is_empty() {
            if let Some(mutable) = g.equal_mutable.clone() {
                release_equal_mutable(cm, records, &mutable, g)?;
            } else {
                match cm.leases.delete(&self.rec.view_lease_id()) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                self.rec.state_mut(g).mount_cache = None;
            }
        }
        Ok(())
    }

    /// Commits the equal-mutable twin's snapshot under this record's id and
    /// retires the twin. Idempotent once the twin is gone.
    pub fn finalize(&self) -> CacheResult<()> {
        let cm = self.rec.cm()?;
        let mut records = cm.records.lock().unwrap_or_else(|e| e.into_inner());
        let rec = self.rec.clone();
        let mut g = rec.lock();
        finalize_record(&cm, &mut records, &rec, &mut g)
    }

    /// Materializes the record on disk if it is lazy. Idempotent and
    /// single-flight per record id.
    pub fn extract(&self, cancel: &CancelToken) -> CacheResult<()> {
        let cm = self.rec.cm()?;
        lazy::extract(&cm, &self.rec, &self.desc_handlers, cancel)
    }

    /// Returns mounts exposing the record's content, extracting first if
    /// needed. `readonly` rewrites the mounts to be read-only.
    pub fn mount(&self, cancel: &CancelToken, readonly: bool) -> CacheResult<Vec<Mount>> {
        let cm = self.rec.cm()?;

        let has_mutable_twin = {
            let g = self.rec.lock();
            g.equal_mutable.is_some()
        };
        if has_mutable_twin && !readonly {
            self.finalize()?;
        }
        self.extract(cancel)?;

        let mounts = lazy::with_remote_snapshot_labels(&cm, &self.rec, &self.desc_handlers, || {
            let mut g = self.rec.lock();
            self.rec.mount_locked(&cm, &mut g)
        })?;

        Ok(if readonly { set_readonly(mounts) } else { mounts })
    }

    /// Looks up an alternate compression variant of the record's blob.
    pub fn get_compression_blob(
        &self,
        compression_type: compression::CompressionType,
    ) -> CacheResult<Descriptor> {
        let cm = self.rec.cm()?;
        let blob = self.rec.meta.get_blob()?.ok_or_else(|| CacheError::Invalid {
            reason: format!("no blob set for cache record {}", self.rec.id),
        })?;
        compression::get_compression_variant_blob(&cm, &blob, compression_type)
    }

    /// Registers an alternate compression variant of the record's blob.
    pub fn add_compression_blob(
        &self,
        desc: &Descriptor,
        compression_type: compression::CompressionType,
    ) -> CacheResult<()> {
        let cm = self.rec.cm()?;
        match cm.leases.add_resource(
            &self.rec.id,
            Resource { id: desc.digest.to_string(), kind: "content".to_string() },
        ) {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }
        let blob = self.rec.meta.get_blob()?.ok_or_else(|| CacheError::Invalid {
            reason: format!("no blob set for cache record {}", self.rec.id),
        })?;
        compression::add_compression_variant(&cm, &blob, desc, compression_type)
    }

    /// Rebuilds the blob descriptor from persisted metadata and content
    /// store labels.
    pub fn oci_desc(&self) -> CacheResult<Descriptor> {
        let cm = self.rec.cm()?;
        lazy::record_oci_desc(&cm, &self.rec, &self.desc_handlers)
    }
}

/// Releases a list of handles, accumulating failures.
pub fn release_refs(refs: Vec<ImmutableRef>) -> CacheResult<()> {
    let mut errors = Vec::new();
    for r in refs {
        if let Err(e) = r.release() {
            errors.push(e);
        }
    }
    match CacheError::join(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The release path for the mutable side of an equal pair, triggered when
/// the immutable side loses its last handle. Requires the manager lock and
/// the shared twin lock.
pub(crate) fn release_equal_mutable(
    cm: &ManagerInner,
    records: &mut HashMap<String, Arc<CacheRecord>>,
    mutable: &Arc<CacheRecord>,
    g: &mut TwinState,
) -> CacheResult<()> {
    let trigger = g.mutable_trigger;
    // the twin link is the only remaining owner of the mutable side
    mutable.state_mut(g).refs.clear();

    if !mutable.meta.has_cache_policy_retain()? {
        if let Some(immutable) = g.equal_immutable.clone() {
            if immutable.meta.has_cache_policy_retain()? {
                if trigger {
                    mutable.meta.update_last_used()?;
                    g.mutable_trigger = false;
                }
                return Ok(());
            }
            immutable.remove(cm, records, false)?;
            g.equal_immutable = None;
            g.immutable = RecordState::default();
        }
        g.equal_mutable = None;
        mutable.remove(cm, records, true)?;
    } else if trigger {
        mutable.meta.update_last_used()?;
        g.mutable_trigger = false;
    }
    Ok(())
}

/// Commits the equal-mutable twin's snapshot to this record's snapshot id,
/// promotes the lease, and retires the twin. Requires the manager lock and
/// the shared twin lock.
pub(crate) fn finalize_record(
    cm: &ManagerInner,
    records: &mut HashMap<String, Arc<CacheRecord>>,
    rec: &Arc<CacheRecord>,
    g: &mut TwinState,
) -> CacheResult<()> {
    let mutable = match g.equal_mutable.clone() {
        Some(m) => m,
        None => return Ok(()),
    };

    match cm.leases.create(&rec.id, flat_lease_labels()) {
        Ok(_) => {}
        Err(e) if e.is_already_exists() => {}
        Err(e) => return Err(e.into()),
    }

    let snapshot_id = rec.snapshot_id()?;
    if let Err(e) = cm.leases.add_resource(
        &rec.id,
        Resource {
            id: snapshot_id.clone(),
            kind: format!("snapshots/{}", cm.snapshotter.name()),
        },
    ) {
        if !e.is_already_exists() {
            let _ = cm.leases.delete(&rec.id);
            return Err(e.into());
        }
    }

    if let Err(e) = cm.snapshotter.commit(&snapshot_id, &mutable.snapshot_id()?) {
        let _ = cm.leases.delete(&rec.id);
        return Err(e.into());
    }
    rec.state_mut(g).mount_cache = None;

    g.mutable.dead = true;
    mutable.remove(cm, records, true)?;
    g.equal_mutable = None;
    g.mutable = RecordState::default();
    g.mutable_trigger = false;

    rec.meta.clear_equal_mutable()?;
    rec.meta.commit_metadata()?;
    debug!(id = %rec.id, snapshot = %snapshot_id, "finalized record");
    Ok(())
}

/// Converts a mutable record into a new immutable record sharing its data.
/// Requires the manager lock and the twin lock of `mrec`.
pub(crate) fn commit_locked(
    cm: &Arc<ManagerInner>,
    records: &mut HashMap<String, Arc<CacheRecord>>,
    mrec: &Arc<CacheRecord>,
    g: &mut TwinState,
    trigger: bool,
    desc_handlers: DescHandlers,
) -> CacheResult<ImmutableRef> {
    if !mrec.mutable || mrec.state(g).refs.is_empty() {
        return Err(CacheError::Invalid {
            reason: format!("invalid mutable ref {}", mrec.id),
        });
    }

    let id = uuid::Uuid::new_v4().simple().to_string();
    let md = cm.store.metadata(&id);
    if let Some(descr) = mrec.meta.get_description()? {
        md.queue_description(&descr)?;
    }

    let rec = Arc::new(CacheRecord::new_paired(
        id.clone(),
        false,
        Arc::downgrade(cm),
        md,
        mrec.parents.clone_refs(),
        mrec,
    ));

    initialize_metadata(&rec.meta, &rec.parents, None, &RefOptions::default())?;
    records.insert(id.clone(), rec.clone());

    mrec.meta.commit_metadata()?;

    rec.meta.queue_committed(&true)?;
    rec.meta.queue_size(SIZE_UNKNOWN)?;
    rec.meta.queue_snapshot_id(&id)?;
    rec.meta.queue_equal_mutable(&mrec.id)?;
    rec.meta.commit_metadata()?;

    g.immutable = RecordState::default();
    g.equal_immutable = Some(rec.clone());
    g.equal_mutable = Some(mrec.clone());

    debug!(mutable = %mrec.id, immutable = %id, "committed mutable record");
    Ok(new_immutable(&rec, g, trigger, desc_handlers))
}

impl MutableRef {
    /// The record id.
    pub fn id(&self) -> &str {
        &self.rec.id
    }

    /// The descriptor handler registered for `digest`, if any.
    pub fn desc_handler(&self, digest: &Digest) -> Option<Arc<DescHandler>> {
        self.desc_handlers.get(digest).cloned()
    }

    /// Converts this record into an immutable record sharing its data. The
    /// mutable handle stays valid and must still be released.
    pub fn commit(&self) -> CacheResult<ImmutableRef> {
        let cm = self.rec.cm()?;
        let mut records = cm.records.lock().unwrap_or_else(|e| e.into_inner());
        let rec = self.rec.clone();
        let mut g = rec.lock();
        commit_locked(
            &cm,
            &mut records,
            &rec,
            &mut g,
            true,
            self.desc_handlers.clone(),
        )
    }

    /// Returns mounts for the writable working snapshot. Remote-snapshot
    /// hints are applied along the parent chain while mounting.
    pub fn mount(&self, _cancel: &CancelToken, readonly: bool) -> CacheResult<Vec<Mount>> {
        let cm = self.rec.cm()?;
        let mounts = match &self.rec.parents {
            crate::record::ParentRefs::Layer(p) => {
                let parent = p.rec.clone();
                lazy::with_remote_snapshot_labels(&cm, &parent, &self.desc_handlers, || {
                    let mut g = self.rec.lock();
                    self.rec.mount_locked(&cm, &mut g)
                })?
            }
            _ => {
                let mut g = self.rec.lock();
                self.rec.mount_locked(&cm, &mut g)?
            }
        };
        Ok(if readonly { set_readonly(mounts) } else { mounts })
    }

    /// Releases this handle. Without a retain policy on either side of the
    /// pair, the record (and a non-retained immutable twin) are removed.
    pub fn release(self) -> CacheResult<()> {
        let cm = self.rec.cm()?;
        let mut records = cm.records.lock().unwrap_or_else(|e| e.into_inner());
        let rec = self.rec.clone();
        let mut g = rec.lock();

        rec.state_mut(&mut g).refs.remove(&self.handle);

        if !rec.meta.has_cache_policy_retain()? {
            if let Some(immutable) = g.equal_immutable.clone() {
                if immutable.meta.has_cache_policy_retain()? {
                    if self.trigger_last_used {
                        rec.meta.update_last_used()?;
                    }
                    return Ok(());
                }
                immutable.remove(&cm, &mut records, false)?;
                g.equal_immutable = None;
                g.immutable = RecordState::default();
            }
            g.equal_mutable = None;
            rec.remove(&cm, &mut records, true)?;
            Ok(())
        } else {
            if self.trigger_last_used {
                rec.meta.update_last_used()?;
            }
            Ok(())
        }
    }
}
