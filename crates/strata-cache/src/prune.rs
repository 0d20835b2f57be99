//! Disk usage accounting and heuristic pruning.
//!
//! Disk usage snapshots every live record, then propagates reference counts
//! transitively: a record only counts toward its parents' usage while it is
//! itself referenced. Pruning runs in passes under its own mutex; in GC mode
//! (a byte budget) each pass deletes the single record with the lowest
//! combined last-used/usage-count score until the budget is met.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use strata_snapshot::{CancelToken, Digest};

use crate::error::{CacheError, CacheResult};
use crate::manager::{CacheManager, ManagerInner, RefOptions};
use crate::metadata::{RecordType, SIZE_UNKNOWN};
use crate::record::{layer_digest_chain_locked, CacheRecord, ParentRefs, TwinSide};

/// Reports whether a record is also referenced outside this cache.
pub trait ExternalRefChecker: Send + Sync {
    /// Returns true when `id` (with the given layer digest chain) is in use
    /// externally.
    fn exists(&self, id: &str, chain: &[Digest]) -> bool;
}

/// Factory producing a fresh checker per prune or disk-usage pass.
pub type ExternalRefCheckerFn =
    Arc<dyn Fn() -> CacheResult<Box<dyn ExternalRefChecker>> + Send + Sync>;

/// Usage report for one record.
#[derive(Debug, Clone)]
pub struct UsageInfo {
    /// Record id.
    pub id: String,
    /// True for mutable records.
    pub mutable: bool,
    /// True while any handle is live.
    pub in_use: bool,
    /// Total size in bytes; [`SIZE_UNKNOWN`] while uncomputed.
    pub size: i64,
    /// Record creation time.
    pub created_at: SystemTime,
    /// Human-readable description.
    pub description: String,
    /// Last time a tracking handle was released.
    pub last_used_at: Option<SystemTime>,
    /// Number of recorded uses.
    pub usage_count: u64,
    /// Direct parent record ids.
    pub parents: Vec<String>,
    /// Record classification.
    pub record_type: RecordType,
    /// True when the external ref checker reports outside users.
    pub shared: bool,
}

/// Structured record filter over the usage-info field set.
#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    /// Match only these record ids (empty: any).
    pub ids: Vec<String>,
    /// Match only these record types (empty: any).
    pub record_types: Vec<RecordType>,
    /// Match records with this mutability.
    pub mutable: Option<bool>,
    /// Match records with this in-use state.
    pub in_use: Option<bool>,
    /// Match records with this shared state.
    pub shared: Option<bool>,
    /// Match records with this direct parent.
    pub parent: Option<String>,
    /// Match records whose description contains this substring.
    pub description_contains: Option<String>,
}

impl UsageFilter {
    /// Returns true when `info` satisfies every set constraint.
    pub fn matches(&self, info: &UsageInfo) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| id == &info.id) {
            return false;
        }
        if !self.record_types.is_empty() && !self.record_types.contains(&info.record_type) {
            return false;
        }
        if let Some(mutable) = self.mutable {
            if info.mutable != mutable {
                return false;
            }
        }
        if let Some(in_use) = self.in_use {
            if info.in_use != in_use {
                return false;
            }
        }
        if let Some(shared) = self.shared {
            if info.shared != shared {
                return false;
            }
        }
        if let Some(parent) = &self.parent {
            if !info.parents.iter().any(|p| p == parent) {
                return false;
            }
        }
        if let Some(substr) = &self.description_contains {
            if !info.description.contains(substr.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Options for [`CacheManager::disk_usage`].
#[derive(Clone, Default)]
pub struct DiskUsageOptions {
    /// Optional record filter.
    pub filter: Option<UsageFilter>,
}

/// Options for one prune pass.
#[derive(Clone, Default)]
pub struct PruneOptions {
    /// Optional record filter.
    pub filter: Option<UsageFilter>,
    /// Include internal, frontend and shared records.
    pub all: bool,
    /// Skip records used more recently than this.
    pub keep_duration: Option<Duration>,
    /// When non-zero, garbage-collect until total size fits the budget.
    pub keep_bytes: i64,
}

struct CacheUsageInfo {
    refs: i64,
    parents: Vec<String>,
    size: i64,
    mutable: bool,
    created_at: SystemTime,
    usage_count: u64,
    last_used_at: Option<SystemTime>,
    description: String,
    double_ref: bool,
    record_type: RecordType,
    shared: bool,
    parent_chain: Vec<Digest>,
}

struct DeleteCandidate {
    rec: Arc<CacheRecord>,
    last_used_at: Option<SystemTime>,
    usage_count: u64,
    last_used_index: usize,
    usage_count_index: usize,
}

struct PruneCtx {
    filter: Option<UsageFilter>,
    all: bool,
    checker: Option<Box<dyn ExternalRefChecker>>,
    keep_duration: Option<Duration>,
    keep_bytes: i64,
    total_size: i64,
}

fn direct_parents(rec: &CacheRecord) -> Vec<String> {
    match &rec.parents {
        ParentRefs::Layer(p) => vec![p.rec.id.clone()],
        ParentRefs::Merge(ps) => ps.iter().map(|p| p.rec.id.clone()).collect(),
        _ => Vec::new(),
    }
}

impl CacheManager {
    /// Reports the usage of every live record, with transitive reference
    /// propagation, shared marking and parallel size resolution.
    pub fn disk_usage(
        &self,
        cancel: &CancelToken,
        opts: &DiskUsageOptions,
    ) -> CacheResult<Vec<UsageInfo>> {
        let mut m: HashMap<String, CacheUsageInfo> = HashMap::new();
        let mut rescan: HashSet<String> = HashSet::new();

        {
            let records = self.inner.lock_records();
            for (id, rec) in records.iter() {
                let mut g = rec.lock();
                // skip the half of an equal pair that merely shares data
                let duplicate = match rec.side {
                    TwinSide::Mutable => {
                        g.equal_immutable.is_some() && !g.immutable.refs.is_empty()
                    }
                    TwinSide::Immutable => {
                        g.equal_mutable.is_some() && rec.state(&g).refs.is_empty()
                    }
                };
                if duplicate {
                    continue;
                }

                let (usage_count, last_used_at) = rec.meta.get_last_used()?;
                let refs = rec.state(&g).refs.len() as i64;
                let mut size = rec.meta.get_size()?;
                if rec.mutable && refs > 0 {
                    // the working set is being written to; size is undefined
                    size = 0;
                }
                let info = CacheUsageInfo {
                    refs,
                    parents: direct_parents(rec),
                    size,
                    mutable: rec.mutable,
                    created_at: rec.meta.get_created_at()?.unwrap_or(UNIX_EPOCH),
                    usage_count,
                    last_used_at,
                    description: rec.meta.get_description()?.unwrap_or_default(),
                    double_ref: rec.side == TwinSide::Mutable && g.equal_immutable.is_some(),
                    record_type: rec.meta.get_record_type()?.unwrap_or_default(),
                    shared: false,
                    parent_chain: layer_digest_chain_locked(rec, &mut g)?,
                };
                m.insert(id.clone(), info);
                rescan.insert(id.clone());
            }
        }

        // a record contributes to its parents' reference counts only while
        // it is referenced itself; unreferenced records propagate the
        // decrement transitively (twice for the equal-pair double ref)
        while !rescan.is_empty() {
            let ids: Vec<String> = rescan.iter().cloned().collect();
            for id in ids {
                let (refs, parents, double_ref) = match m.get(&id) {
                    Some(v) => (v.refs, v.parents.clone(), v.double_ref),
                    None => {
                        rescan.remove(&id);
                        continue;
                    }
                };
                if refs == 0 {
                    for p in parents {
                        if let Some(pv) = m.get_mut(&p) {
                            pv.refs -= 1;
                            if double_ref {
                                pv.refs -= 1;
                            }
                            rescan.insert(p);
                        }
                    }
                }
                rescan.remove(&id);
            }
        }

        self.mark_shared(&mut m)?;

        let mut du: Vec<UsageInfo> = m
            .into_iter()
            .map(|(id, v)| UsageInfo {
                id,
                mutable: v.mutable,
                in_use: v.refs > 0,
                size: v.size,
                created_at: v.created_at,
                description: v.description,
                last_used_at: v.last_used_at,
                usage_count: v.usage_count,
                parents: v.parents,
                record_type: v.record_type,
                shared: v.shared,
            })
            .filter(|info| opts.filter.as_ref().map_or(true, |f| f.matches(info)))
            .collect();

        cancel.check()?;

        // resolve unknown sizes in parallel
        let unknown: Vec<usize> = du
            .iter()
            .enumerate()
            .filter(|(_, d)| d.size == SIZE_UNKNOWN)
            .map(|(i, _)| i)
            .collect();
        if !unknown.is_empty() {
            let results: Vec<(usize, CacheResult<i64>)> = std::thread::scope(|s| {
                let handles: Vec<_> = unknown
                    .iter()
                    .map(|&i| {
                        let id = du[i].id.clone();
                        let inner = &self.inner;
                        s.spawn(move || (i, resolve_size(inner, &id)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join().unwrap_or((
                            usize::MAX,
                            Err(CacheError::Invalid {
                                reason: "size worker panicked".to_string(),
                            }),
                        ))
                    })
                    .collect()
            });
            let mut first_err = None;
            for (i, res) in results {
                match res {
                    Ok(size) => {
                        if let Some(d) = du.get_mut(i) {
                            d.size = size;
                        }
                    }
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }
        }

        Ok(du)
    }

    fn mark_shared(&self, m: &mut HashMap<String, CacheUsageInfo>) -> CacheResult<()> {
        let factory = match &self.inner.ref_checker {
            Some(f) => f,
            None => return Ok(()),
        };
        let checker = factory()?;

        let ids: Vec<String> = m.keys().cloned().collect();
        for id in ids {
            let already = m.get(&id).map(|v| v.shared).unwrap_or(true);
            if already {
                continue;
            }
            let chain = m.get(&id).map(|v| v.parent_chain.clone()).unwrap_or_default();
            if !checker.exists(&id, &chain) {
                continue;
            }
            // a shared record keeps all its ancestors shared as well
            let mut stack = vec![id];
            while let Some(cur) = stack.pop() {
                if let Some(v) = m.get_mut(&cur) {
                    if !v.shared {
                        v.shared = true;
                        stack.extend(v.parents.iter().cloned());
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs one prune pass per options entry, serialized against other
    /// prunes. Deleted records are reported on `ch` when provided.
    pub fn prune(
        &self,
        cancel: &CancelToken,
        ch: Option<&Sender<UsageInfo>>,
        opts: &[PruneOptions],
    ) -> CacheResult<()> {
        let _prune_guard = self.inner.mu_prune.lock().unwrap_or_else(|e| e.into_inner());
        for opt in opts {
            self.prune_once(cancel, ch, opt)?;
        }
        Ok(())
    }

    fn prune_once(
        &self,
        cancel: &CancelToken,
        ch: Option<&Sender<UsageInfo>>,
        opt: &PruneOptions,
    ) -> CacheResult<()> {
        let checker = match &self.inner.ref_checker {
            Some(f) if !opt.all || opt.filter.is_some() => Some(f()?),
            _ => None,
        };

        let mut total_size = 0i64;
        if opt.keep_bytes != 0 {
            let du = self.disk_usage(cancel, &DiskUsageOptions::default())?;
            for ui in du {
                if !ui.shared {
                    total_size += ui.size;
                }
            }
        }

        let mut ctx = PruneCtx {
            filter: opt.filter.clone(),
            all: opt.all,
            checker,
            keep_duration: opt.keep_duration,
            keep_bytes: opt.keep_bytes,
            total_size,
        };
        self.prune_loop(cancel, ch, &mut ctx)
    }

    fn prune_loop(
        &self,
        cancel: &CancelToken,
        ch: Option<&Sender<UsageInfo>>,
        ctx: &mut PruneCtx,
    ) -> CacheResult<()> {
        loop {
            if ctx.keep_bytes != 0 && ctx.total_size < ctx.keep_bytes {
                info!(total_size = ctx.total_size, keep_bytes = ctx.keep_bytes, "prune budget met");
                return Ok(());
            }

            let gc_mode = ctx.keep_bytes != 0;
            let cutoff = ctx
                .keep_duration
                .and_then(|d| SystemTime::now().checked_sub(d));

            let mut to_delete: Vec<DeleteCandidate> = Vec::new();
            {
                let records = self.inner.lock_records();
                for (id, rec) in records.iter() {
                    let mut g = rec.lock();

                    let duplicate = match rec.side {
                        TwinSide::Mutable => {
                            g.equal_immutable.is_some() && !g.immutable.refs.is_empty()
                        }
                        TwinSide::Immutable => {
                            g.equal_mutable.is_some() && rec.state(&g).refs.is_empty()
                        }
                    };
                    if duplicate || rec.is_dead_locked(&g) {
                        continue;
                    }
                    if !rec.state(&g).refs.is_empty() {
                        continue;
                    }

                    let record_type = rec.meta.get_record_type()?.unwrap_or_default();
                    let shared = match &ctx.checker {
                        Some(c) => c.exists(id, &layer_digest_chain_locked(rec, &mut g)?),
                        None => false,
                    };
                    if !ctx.all && (record_type != RecordType::Regular || shared) {
                        continue;
                    }

                    let (usage_count, last_used_at) = rec.meta.get_last_used()?;
                    if let (Some(cutoff), Some(at)) = (cutoff, last_used_at) {
                        if at > cutoff {
                            continue;
                        }
                    }

                    let info = UsageInfo {
                        id: id.clone(),
                        mutable: rec.mutable,
                        in_use: false,
                        size: SIZE_UNKNOWN,
                        created_at: rec.meta.get_created_at()?.unwrap_or(UNIX_EPOCH),
                        description: rec.meta.get_description()?.unwrap_or_default(),
                        last_used_at,
                        usage_count,
                        parents: Vec::new(),
                        record_type,
                        shared,
                    };
                    if let Some(f) = &ctx.filter {
                        if !f.matches(&info) {
                            continue;
                        }
                    }

                    if !gc_mode {
                        // mark deleted up front so a crash mid-cleanup is
                        // finished on the next start
                        rec.state_mut(&mut g).dead = true;
                        rec.meta.queue_deleted(&true)?;
                        rec.meta.commit_metadata()?;
                    }
                    to_delete.push(DeleteCandidate {
                        rec: rec.clone(),
                        last_used_at,
                        usage_count,
                        last_used_index: 0,
                        usage_count_index: 0,
                    });
                }

                if gc_mode && !to_delete.is_empty() {
                    sort_delete_candidates(&mut to_delete);
                    // only the lowest-scored record is removed per pass; its
                    // eligibility is re-verified before marking
                    let mut victim = None;
                    for cand in to_delete.drain(..) {
                        let mut g = cand.rec.lock();
                        if cand.rec.is_dead_locked(&g)
                            || !cand.rec.state(&g).refs.is_empty()
                        {
                            continue;
                        }
                        cand.rec.state_mut(&mut g).dead = true;
                        cand.rec.meta.queue_deleted(&true)?;
                        cand.rec.meta.commit_metadata()?;
                        drop(g);
                        victim = Some(cand);
                        break;
                    }
                    to_delete = victim.into_iter().collect();
                }
            }

            if to_delete.is_empty() {
                return Ok(());
            }

            // resolve sizes while no locks are held
            for cand in &to_delete {
                let mut size = cand.rec.meta.get_size()?;
                if size == SIZE_UNKNOWN {
                    let twin = {
                        let g = cand.rec.lock();
                        g.equal_immutable.clone()
                    };
                    if let Some(t) = twin {
                        size = t.meta.get_size()?;
                    }
                }
                if size == SIZE_UNKNOWN {
                    cand.rec.size(&self.inner)?;
                }
            }

            {
                let mut records = self.inner.lock_records();
                let mut errors = Vec::new();
                for cand in &to_delete {
                    let rec = &cand.rec;
                    let mut g = rec.lock();

                    let (usage_count, last_used_at) = rec.meta.get_last_used()?;
                    let mut size = rec.meta.get_size()?;
                    if size == SIZE_UNKNOWN {
                        if let Some(t) = &g.equal_immutable {
                            size = t.meta.get_size()?;
                        }
                    }
                    let infoev = UsageInfo {
                        id: rec.id.clone(),
                        mutable: rec.mutable,
                        in_use: !rec.state(&g).refs.is_empty(),
                        size,
                        created_at: rec.meta.get_created_at()?.unwrap_or(UNIX_EPOCH),
                        description: rec.meta.get_description()?.unwrap_or_default(),
                        last_used_at,
                        usage_count,
                        parents: direct_parents(rec),
                        record_type: rec.meta.get_record_type()?.unwrap_or_default(),
                        shared: false,
                    };
                    ctx.total_size -= size;

                    if let Some(t) = g.equal_immutable.clone() {
                        if let Err(e) = t.remove(&self.inner, &mut records, false) {
                            errors.push(e);
                        }
                        g.equal_immutable = None;
                    }
                    if let Err(e) = rec.remove(&self.inner, &mut records, true) {
                        errors.push(e);
                    }
                    debug!(id = %rec.id, size, "pruned cache record");

                    if let Some(ch) = ch {
                        let _ = ch.send(infoev);
                    }
                }
                if let Some(e) = CacheError::join(errors) {
                    return Err(e);
                }
            }

            cancel.check()?;
        }
    }
}

fn resolve_size(inner: &Arc<ManagerInner>, id: &str) -> CacheResult<i64> {
    let opts = RefOptions { no_update_last_used: true, ..RefOptions::default() };
    let r = {
        let mut records = inner.lock_records();
        match inner.get_inner(&mut records, id, &opts) {
            Ok(r) => r,
            // the record vanished or became unloadable; report zero
            Err(_) => return Ok(0),
        }
    };
    let size = r.size();
    let released = r.release();
    let size = size?;
    released?;
    Ok(size)
}

/// Orders GC candidates by a combined score of normalized last-used rank
/// and usage-count rank; the lowest score is reclaimed first.
fn sort_delete_candidates(v: &mut [DeleteCandidate]) {
    v.sort_by(|a, b| match (a.last_used_at, b.last_used_at) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    });
    let mut max_last_used_index = 0usize;
    let mut val: Option<SystemTime> = None;
    for c in v.iter_mut() {
        if let Some(at) = c.last_used_at {
            if val.map_or(true, |v| at > v) {
                val = Some(at);
                max_last_used_index += 1;
            }
        }
        c.last_used_index = max_last_used_index;
    }

    v.sort_by_key(|c| c.usage_count);
    let mut max_usage_index = 0usize;
    let mut count = 0u64;
    for c in v.iter_mut() {
        if c.usage_count != count {
            count = c.usage_count;
            max_usage_index += 1;
        }
        c.usage_count_index = max_usage_index;
    }

    let ml = max_last_used_index.max(1) as f64;
    let mu = max_usage_index.max(1) as f64;
    v.sort_by(|a, b| {
        let sa = a.last_used_index as f64 / ml + a.usage_count_index as f64 / mu;
        let sb = b.last_used_index as f64 / ml + b.usage_count_index as f64 / mu;
        sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
    });
}
