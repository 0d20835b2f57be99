//! Lazy materialization: turning blob-only records into on-disk snapshots.
//!
//! `extract` is idempotent and single-flight per record id. Layers unpack
//! through a staging snapshot guarded by an ephemeral lease: the parent is
//! unlazied concurrently with the blob fetch, then the blob is applied and
//! the staging snapshot committed. Merge and diff records materialize by
//! unlazying every constituent layer concurrently and handing the ordered
//! diff list to the merge snapshotter.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use strata_snapshot::{
    flat_lease_labels, CancelToken, ContentStore, Descriptor, LayerApplier, LayerDiff,
    LeaseManager, Resource, Snapshotter, UNCOMPRESSED_ANNOTATION,
};

use crate::compression;
use crate::desc::DescHandlers;
use crate::error::{CacheError, CacheResult};
use crate::manager::ManagerInner;
use crate::metadata::SIZE_UNKNOWN;
use crate::record::{layer_walk_records, CacheRecord, ParentRefs, RecordKind};

/// Label a snapshotter puts on snapshots whose content lives remotely.
pub(crate) const REMOTE_SNAPSHOT_LABEL: &str = "containerd.io/snapshot/remote";

/// Name of the snapshotter backend with remote-snapshot support.
const STARGZ_SNAPSHOTTER: &str = "stargz";

/// Materializes `rec` on disk if needed.
pub(crate) fn extract(
    cm: &Arc<ManagerInner>,
    rec: &Arc<CacheRecord>,
    dhs: &DescHandlers,
    cancel: &CancelToken,
) -> CacheResult<()> {
    if matches!(rec.kind(), RecordKind::Layer | RecordKind::BaseLayer)
        && !rec.meta.get_blob_only()?.unwrap_or(false)
    {
        return Ok(());
    }
    with_remote_snapshot_labels(cm, rec, dhs, || unlazy(cm, rec, dhs, cancel))
}

/// Single-flight unlazy keyed by record id; concurrent calls coalesce.
pub(crate) fn unlazy(
    cm: &Arc<ManagerInner>,
    rec: &Arc<CacheRecord>,
    dhs: &DescHandlers,
    cancel: &CancelToken,
) -> CacheResult<()> {
    let key = format!("unlazy::{}", rec.id);
    cm.unlazy_g.do_call(&key, || {
        if cm.snapshotter.stat(&rec.snapshot_id()?).is_ok() {
            return Ok(());
        }
        match rec.kind() {
            RecordKind::Merge | RecordKind::Diff => unlazy_diff_merge(cm, rec, dhs, cancel),
            RecordKind::Layer | RecordKind::BaseLayer => unlazy_layer(cm, rec, dhs, cancel),
        }
    })
}

/// Materializes a merge or diff record: unlazy every constituent layer, then
/// hand the ordered diff list to the merge snapshotter.
fn unlazy_diff_merge(
    cm: &Arc<ManagerInner>,
    rec: &Arc<CacheRecord>,
    dhs: &DescHandlers,
    cancel: &CancelToken,
) -> CacheResult<()> {
    let mut layers: Vec<Arc<CacheRecord>> = Vec::new();
    layer_walk_records(rec, &mut |r| layers.push(r.clone()));

    let mut diffs = Vec::with_capacity(layers.len());
    let mut to_unlazy: Vec<Arc<CacheRecord>> = Vec::new();
    for r in &layers {
        match (&r.parents, r.kind()) {
            (ParentRefs::Diff { lower, upper }, RecordKind::Diff) => {
                let mut diff = LayerDiff { lower: None, upper: None };
                if let Some(l) = lower {
                    diff.lower = Some(l.rec.snapshot_id()?);
                    to_unlazy.push(l.rec.clone());
                }
                if let Some(u) = upper {
                    diff.upper = Some(u.rec.snapshot_id()?);
                    to_unlazy.push(u.rec.clone());
                }
                diffs.push(diff);
            }
            (ParentRefs::Layer(p), RecordKind::Layer) => {
                diffs.push(LayerDiff {
                    lower: Some(p.rec.snapshot_id()?),
                    upper: Some(r.snapshot_id()?),
                });
                to_unlazy.push(r.clone());
            }
            (_, RecordKind::BaseLayer) => {
                diffs.push(LayerDiff { lower: None, upper: Some(r.snapshot_id()?) });
                to_unlazy.push(r.clone());
            }
            _ => {}
        }
    }

    // unlazy all constituents concurrently; the first failure wins and the
    // merge below never runs on partial state
    std::thread::scope(|s| -> CacheResult<()> {
        let handles: Vec<_> = to_unlazy
            .iter()
            .map(|r| s.spawn(move || unlazy(cm, r, dhs, cancel)))
            .collect();
        let mut first: Option<CacheError> = None;
        for h in handles {
            match h.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first.is_none() {
                        first = Some(e);
                    }
                }
                Err(_) => {
                    if first.is_none() {
                        first = Some(CacheError::Invalid {
                            reason: "unlazy worker panicked".to_string(),
                        });
                    }
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })?;

    let snapshot_id = rec.snapshot_id()?;
    cm.snapshotter.merge(cancel, &snapshot_id, &diffs)?;
    debug!(id = %rec.id, layers = diffs.len(), "materialized merged snapshot");
    Ok(())
}

/// Unpacks one layer: concurrent parent unlazy + blob fetch, then apply the
/// blob onto a staging snapshot and commit it under the record's snapshot id.
fn unlazy_layer(
    cm: &Arc<ManagerInner>,
    rec: &Arc<CacheRecord>,
    dhs: &DescHandlers,
    cancel: &CancelToken,
) -> CacheResult<()> {
    if !rec.meta.get_blob_only()?.unwrap_or(false) {
        return Ok(());
    }

    let desc = record_oci_desc(cm, rec, dhs)?;
    let dh = dhs.get(&desc.digest).cloned();

    let lease_id = format!("extract-{}", Uuid::new_v4().simple());
    cm.leases.create(&lease_id, flat_lease_labels())?;

    if let Some(progress) = dh.as_ref().and_then(|d| d.progress.clone()) {
        progress.started(&desc);
        progress.status(&desc, "extracting");
    }

    let result = (|| -> CacheResult<()> {
        let parent_rec = match &rec.parents {
            ParentRefs::Layer(p) => Some(p.rec.clone()),
            _ => None,
        };

        let mut parent_snapshot = String::new();
        std::thread::scope(|s| -> CacheResult<()> {
            let fetch = s.spawn(|| fetch_blob(cm, &desc, dh.clone(), cancel));
            let parent_result = match &parent_rec {
                Some(p) => unlazy(cm, p, dhs, cancel).and_then(|_| p.snapshot_id()),
                None => Ok(String::new()),
            };
            let fetch_result = fetch.join().map_err(|_| CacheError::Invalid {
                reason: "blob fetch worker panicked".to_string(),
            })?;
            parent_snapshot = parent_result?;
            fetch_result
        })?;

        let staging = format!("extract-{}", Uuid::new_v4().simple());
        cm.leases.add_resource(
            &lease_id,
            Resource {
                id: staging.clone(),
                kind: format!("snapshots/{}", cm.snapshotter.name()),
            },
        )?;
        cm.snapshotter.prepare(&staging, &parent_snapshot, HashMap::new())?;
        let mounts = cm.snapshotter.mounts(&staging)?;
        cm.applier.apply(cancel, &desc, &mounts)?;
        match cm.snapshotter.commit(&rec.snapshot_id()?, &staging) {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }

        rec.meta.queue_blob_only(&false)?;
        rec.meta.queue_size(SIZE_UNKNOWN)?;
        rec.meta.commit_metadata()?;
        debug!(id = %rec.id, blob = %desc.digest, "unpacked layer");
        Ok(())
    })();

    // the ephemeral lease goes away on success and failure alike; on failure
    // it takes the partially prepared staging snapshot with it
    if let Err(e) = cm.leases.delete(&lease_id) {
        if !e.is_not_found() {
            warn!(lease = %lease_id, error = %e, "failed to delete extract lease");
        }
    }

    if let Some(progress) = dh.as_ref().and_then(|d| d.progress.clone()) {
        progress.finished(&desc, result.is_ok());
    }
    result
}

/// Ensures the blob bytes are in the content store, fetching through the
/// descriptor handler if needed. Fetches coalesce per digest.
fn fetch_blob(
    cm: &Arc<ManagerInner>,
    desc: &Descriptor,
    dh: Option<Arc<crate::desc::DescHandler>>,
    cancel: &CancelToken,
) -> CacheResult<()> {
    match cm.content.info(&desc.digest) {
        Ok(_) => return Ok(()),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    let dh = dh.ok_or_else(|| CacheError::NeedsRemoteProviders(vec![desc.digest.clone()]))?;

    let key = format!("fetch::{}", desc.digest);
    cm.unlazy_g.do_call(&key, || {
        if cm.content.info(&desc.digest).is_ok() {
            return Ok(());
        }
        cancel.check().map_err(CacheError::from)?;
        dh.provider.fetch(cancel, desc)?;
        match cm.content.info(&desc.digest) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(CacheError::Invalid {
                reason: format!("provider did not materialize blob {}", desc.digest),
            }),
            Err(e) => Err(e.into()),
        }
    })
}

/// Rebuilds the blob descriptor of a record from metadata, stored labels
/// and descriptor-handler annotations.
pub(crate) fn record_oci_desc(
    cm: &ManagerInner,
    rec: &Arc<CacheRecord>,
    dhs: &DescHandlers,
) -> CacheResult<Descriptor> {
    let blob = rec.meta.get_blob()?.ok_or_else(|| CacheError::Invalid {
        reason: format!("no blob set for cache record {}", rec.id),
    })?;
    let mut desc = Descriptor {
        digest: blob.clone(),
        size: rec.meta.get_blob_size()?.unwrap_or(0),
        media_type: rec.meta.get_media_type()?.unwrap_or_default(),
        annotations: HashMap::new(),
    };
    if let Ok(stored) = compression::blob_desc(cm, &blob) {
        desc.annotations = stored.annotations;
    } else if let Some(dh) = dhs.get(&blob) {
        desc.annotations = compression::filter_annotations_for_save(&dh.annotations);
    }
    if let Some(diff_id) = rec.meta.get_diff_id()? {
        desc.annotations
            .insert(UNCOMPRESSED_ANNOTATION.to_string(), diff_id.to_string());
    }
    Ok(desc)
}

/// On remote-capable snapshotters, temporarily labels every remote ancestor
/// snapshot with the handler's hints before running `f`. Label keys carry a
/// per-call unique suffix so concurrent mounts do not collide; all labels
/// are removed on exit.
pub(crate) fn with_remote_snapshot_labels<T>(
    cm: &Arc<ManagerInner>,
    rec: &Arc<CacheRecord>,
    dhs: &DescHandlers,
    f: impl FnOnce() -> CacheResult<T>,
) -> CacheResult<T> {
    if cm.snapshotter.name() != STARGZ_SNAPSHOTTER {
        return f();
    }

    let mut layers: Vec<Arc<CacheRecord>> = Vec::new();
    layer_walk_records(rec, &mut |r| layers.push(r.clone()));

    let mut undo: Vec<(String, Vec<String>, Vec<String>)> = Vec::new();
    for r in &layers {
        let snapshot_id = r.snapshot_id()?;
        let info = match cm.snapshotter.stat(&snapshot_id) {
            Ok(i) => i,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        if !info.labels.contains_key(REMOTE_SNAPSHOT_LABEL) {
            continue;
        }
        let blob = match r.meta.get_blob()? {
            Some(b) => b,
            None => continue,
        };
        let dh = match dhs.get(&blob) {
            Some(d) => d.clone(),
            None => continue,
        };
        if dh.snapshot_labels.is_empty() {
            continue;
        }

        let suffix = Uuid::new_v4().simple().to_string();
        let mut new_info = info.clone();
        let mut fields = Vec::new();
        let mut added = Vec::new();
        for (k, v) in &dh.snapshot_labels {
            let key = format!("{}.{}", k, suffix);
            fields.push(format!("labels.{}", key));
            new_info.labels.insert(key.clone(), v.clone());
            added.push(key);
        }
        cm.snapshotter.update(new_info, &fields)?;
        undo.push((snapshot_id, fields, added));
    }

    let result = f();

    for (snapshot_id, fields, added) in undo {
        match cm.snapshotter.stat(&snapshot_id) {
            Ok(mut info) => {
                for key in &added {
                    info.labels.insert(key.clone(), String::new());
                }
                if let Err(e) = cm.snapshotter.update(info, &fields) {
                    warn!(snapshot = %snapshot_id, error = %e, "failed to remove tmp remote labels");
                }
            }
            Err(e) => {
                warn!(snapshot = %snapshot_id, error = %e, "failed to stat snapshot for label cleanup");
            }
        }
    }

    result
}
