//! Persistent record metadata.
//!
//! Every cache record owns a bag of typed fields addressed by record id,
//! stored through an opaque key-value contract. Writes are queued on the
//! [`CacheMetadata`] handle and flushed atomically by
//! [`CacheMetadata::commit_metadata`]; the chain-id and blob-chain-id
//! secondary indexes are maintained as part of the same batches.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use strata_snapshot::Digest;

use crate::error::{CacheError, CacheResult};

/// Size sentinel for records whose on-disk usage has not been computed.
pub const SIZE_UNKNOWN: i64 = -1;

/// Classification of a record for prune policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// A regular build result.
    #[default]
    Regular,
    /// Internal bookkeeping; skipped by default prunes.
    Internal,
    /// Frontend-owned; skipped by default prunes.
    Frontend,
}

/// Retention policy of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Record is removed when its last handle is released.
    #[default]
    Default,
    /// Record survives release and is reclaimed only by prune.
    Retain,
}

/// A single operation in a write batch.
pub enum BatchOp {
    /// Insert or update a key.
    Put {
        /// The key to write.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// Key-value contract backing metadata persistence.
pub trait KvStore: Send + Sync {
    /// Gets a value by key.
    fn get(&self, key: &[u8]) -> CacheResult<Option<Vec<u8>>>;

    /// Puts a key-value pair, overwriting any existing value.
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> CacheResult<()>;

    /// Deletes a key. Missing keys are not an error.
    fn delete(&self, key: &[u8]) -> CacheResult<()>;

    /// Returns all pairs whose key starts with `prefix`, sorted by key.
    fn scan_prefix(&self, prefix: &[u8]) -> CacheResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies a batch of operations atomically.
    fn write_batch(&self, ops: Vec<BatchOp>) -> CacheResult<()>;
}

/// In-memory KV store backed by a BTreeMap.
#[derive(Default)]
pub struct MemoryKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(e: impl std::fmt::Display) -> CacheError {
    CacheError::Metadata { reason: e.to_string() }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> CacheResult<Option<Vec<u8>>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> CacheResult<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> CacheResult<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> CacheResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read().map_err(poisoned)?;
        let mut result = Vec::new();
        for (k, v) in data.range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), Bound::Unbounded))
        {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> CacheResult<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

fn record_key(id: &str, field: &str) -> Vec<u8> {
    format!("rec/{}/{}", id, field).into_bytes()
}

fn chain_index_key(digest: &Digest, id: &str) -> Vec<u8> {
    format!("idx/chain/{}/{}", digest, id).into_bytes()
}

fn blob_chain_index_key(digest: &Digest, id: &str) -> Vec<u8> {
    format!("idx/blobchain/{}/{}", digest, id).into_bytes()
}

/// Store of all record metadata plus the chain-identity indexes.
#[derive(Clone)]
pub struct MetadataStore {
    kv: Arc<dyn KvStore>,
}

impl MetadataStore {
    /// Wraps a KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Opens the metadata handle for one record id.
    pub fn metadata(&self, id: &str) -> CacheMetadata {
        CacheMetadata {
            store: self.clone(),
            id: id.to_string(),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Returns every record id present in the store.
    pub fn all_ids(&self) -> CacheResult<Vec<String>> {
        let mut ids = Vec::new();
        for (key, _) in self.kv.scan_prefix(b"rec/")? {
            let key = String::from_utf8_lossy(&key);
            if let Some(rest) = key.strip_prefix("rec/") {
                if let Some((id, _)) = rest.split_once('/') {
                    if ids.last().map(String::as_str) != Some(id) {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Returns true if any metadata exists for the id.
    pub fn exists(&self, id: &str) -> CacheResult<bool> {
        Ok(!self
            .kv
            .scan_prefix(format!("rec/{}/", id).as_bytes())?
            .is_empty())
    }

    /// Removes all metadata and index entries for a record.
    pub fn clear(&self, id: &str) -> CacheResult<()> {
        let md = self.metadata(id);
        let mut ops = Vec::new();
        if let Some(chain) = md.get_chain_id()? {
            ops.push(BatchOp::Delete { key: chain_index_key(&chain, id) });
        }
        if let Some(blob_chain) = md.get_blob_chain_id()? {
            ops.push(BatchOp::Delete { key: blob_chain_index_key(&blob_chain, id) });
        }
        for (key, _) in self.kv.scan_prefix(format!("rec/{}/", id).as_bytes())? {
            ops.push(BatchOp::Delete { key });
        }
        self.kv.write_batch(ops)
    }

    /// Returns the ids of records whose chain id equals `digest`.
    pub fn search_chain(&self, digest: &Digest) -> CacheResult<Vec<String>> {
        self.search_index(&format!("idx/chain/{}/", digest))
    }

    /// Returns the ids of records whose blob chain id equals `digest`.
    pub fn search_blob_chain(&self, digest: &Digest) -> CacheResult<Vec<String>> {
        self.search_index(&format!("idx/blobchain/{}/", digest))
    }

    fn search_index(&self, prefix: &str) -> CacheResult<Vec<String>> {
        Ok(self
            .kv
            .scan_prefix(prefix.as_bytes())?
            .into_iter()
            .filter_map(|(key, _)| {
                String::from_utf8_lossy(&key)
                    .strip_prefix(prefix)
                    .map(str::to_string)
            })
            .collect())
    }

    fn get_raw(&self, id: &str, field: &str) -> CacheResult<Option<Vec<u8>>> {
        self.kv.get(&record_key(id, field))
    }
}

fn to_nanos(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

fn from_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos((-nanos) as u64)
    }
}

/// Typed accessors for one record's persisted fields.
///
/// Setters queue; queued values become visible to getters only after
/// [`CacheMetadata::commit_metadata`] flushes them in one batch.
pub struct CacheMetadata {
    store: MetadataStore,
    id: String,
    pending: Mutex<Vec<BatchOp>>,
}

macro_rules! field_accessors {
    ($get:ident, $queue:ident, $field:literal, $ty:ty) => {
        /// Reads the committed value of the field.
        pub fn $get(&self) -> CacheResult<Option<$ty>> {
            self.get_field($field)
        }

        /// Queues a new value for the field.
        pub fn $queue(&self, value: &$ty) -> CacheResult<()> {
            self.queue_field($field, value)
        }
    };
}

impl CacheMetadata {
    /// The record id this metadata belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn get_field<T: DeserializeOwned>(&self, field: &str) -> CacheResult<Option<T>> {
        match self.store.get_raw(&self.id, field)? {
            None => Ok(None),
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| CacheError::Metadata {
                    reason: format!("corrupt field {} of {}: {}", field, self.id, e),
                }),
        }
    }

    fn queue_field<T: Serialize + ?Sized>(&self, field: &str, value: &T) -> CacheResult<()> {
        let raw = serde_json::to_vec(value).map_err(|e| CacheError::Metadata {
            reason: format!("failed to encode field {}: {}", field, e),
        })?;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(BatchOp::Put { key: record_key(&self.id, field), value: raw });
        Ok(())
    }

    /// Flushes all queued writes in one atomic batch.
    pub fn commit_metadata(&self) -> CacheResult<()> {
        let ops = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if ops.is_empty() {
            return Ok(());
        }
        self.store.kv.write_batch(ops)
    }

    field_accessors!(get_parent, queue_parent, "parent", String);
    field_accessors!(get_merge_parents, queue_merge_parents, "mergeParents", Vec<String>);
    field_accessors!(get_diff_lower, queue_diff_lower, "diffLower", String);
    field_accessors!(get_diff_upper, queue_diff_upper, "diffUpper", String);
    field_accessors!(get_description, queue_description, "description", String);
    field_accessors!(get_snapshot_id, queue_snapshot_id, "snapshotID", String);
    field_accessors!(get_committed, queue_committed, "committed", bool);
    field_accessors!(get_deleted, queue_deleted, "deleted", bool);
    field_accessors!(get_blob_only, queue_blob_only, "blobOnly", bool);
    field_accessors!(get_media_type, queue_media_type, "mediaType", String);
    field_accessors!(get_blob_size, queue_blob_size, "blobSize", i64);
    field_accessors!(get_equal_mutable, queue_equal_mutable, "equalMutable", String);
    field_accessors!(get_cache_policy, queue_cache_policy, "cachePolicy", CachePolicy);
    field_accessors!(get_record_type, queue_record_type, "recordType", RecordType);
    field_accessors!(get_layer_type, queue_layer_type, "layerType", String);
    field_accessors!(get_blob, queue_blob, "blob", Digest);
    field_accessors!(get_diff_id, queue_diff_id, "diffID", Digest);

    /// Reads the committed size, or [`SIZE_UNKNOWN`].
    pub fn get_size(&self) -> CacheResult<i64> {
        Ok(self.get_field("size")?.unwrap_or(SIZE_UNKNOWN))
    }

    /// Queues a new size.
    pub fn queue_size(&self, size: i64) -> CacheResult<()> {
        self.queue_field("size", &size)
    }

    /// Reads the creation time.
    pub fn get_created_at(&self) -> CacheResult<Option<SystemTime>> {
        Ok(self.get_field::<i64>("createdAt")?.map(from_nanos))
    }

    /// Queues the creation time.
    pub fn queue_created_at(&self, t: SystemTime) -> CacheResult<()> {
        self.queue_field("createdAt", &to_nanos(t))
    }

    /// Reads the chain id.
    pub fn get_chain_id(&self) -> CacheResult<Option<Digest>> {
        self.get_field("chainID")
    }

    /// Queues the chain id, maintaining the chain index.
    pub fn queue_chain_id(&self, digest: &Digest) -> CacheResult<()> {
        self.queue_field("chainID", digest)?;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(BatchOp::Put { key: chain_index_key(digest, &self.id), value: Vec::new() });
        Ok(())
    }

    /// Reads the blob chain id.
    pub fn get_blob_chain_id(&self) -> CacheResult<Option<Digest>> {
        self.get_field("blobChainID")
    }

    /// Queues the blob chain id, maintaining the blob-chain index.
    pub fn queue_blob_chain_id(&self, digest: &Digest) -> CacheResult<()> {
        self.queue_field("blobChainID", digest)?;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(BatchOp::Put {
            key: blob_chain_index_key(digest, &self.id),
            value: Vec::new(),
        });
        Ok(())
    }

    /// Queues removal of the equal-mutable link.
    pub fn clear_equal_mutable(&self) -> CacheResult<()> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(BatchOp::Delete { key: record_key(&self.id, "equalMutable") });
        Ok(())
    }

    /// Returns true when the cache policy is retain.
    pub fn has_cache_policy_retain(&self) -> CacheResult<bool> {
        Ok(self.get_cache_policy()?.unwrap_or_default() == CachePolicy::Retain)
    }

    /// Reads the usage counter and last-used timestamp.
    pub fn get_last_used(&self) -> CacheResult<(u64, Option<SystemTime>)> {
        let count = self.get_field::<u64>("usageCount")?.unwrap_or(0);
        let at = self.get_field::<i64>("lastUsedAt")?.map(from_nanos);
        Ok((count, at))
    }

    /// Bumps the usage counter and stamps the last-used time, immediately.
    pub fn update_last_used(&self) -> CacheResult<()> {
        let (count, _) = self.get_last_used()?;
        let count_raw = serde_json::to_vec(&(count + 1)).map_err(|e| CacheError::Metadata {
            reason: e.to_string(),
        })?;
        let at_raw =
            serde_json::to_vec(&to_nanos(SystemTime::now())).map_err(|e| CacheError::Metadata {
                reason: e.to_string(),
            })?;
        self.store.kv.write_batch(vec![
            BatchOp::Put { key: record_key(&self.id, "usageCount"), value: count_raw },
            BatchOp::Put { key: record_key(&self.id, "lastUsedAt"), value: at_raw },
        ])
    }

    /// Overrides the last-used timestamp, immediately. Test and migration
    /// hook; normal updates go through [`CacheMetadata::update_last_used`].
    pub fn set_last_used_at(&self, t: SystemTime) -> CacheResult<()> {
        let raw = serde_json::to_vec(&to_nanos(t)).map_err(|e| CacheError::Metadata {
            reason: e.to_string(),
        })?;
        self.store
            .kv
            .write_batch(vec![BatchOp::Put { key: record_key(&self.id, "lastUsedAt"), value: raw }])
    }

    /// Reads the image references pointing at this record.
    pub fn get_image_refs(&self) -> CacheResult<Vec<String>> {
        Ok(self.get_field("imageRefs")?.unwrap_or_default())
    }

    /// Queues appending an image reference, deduplicated.
    pub fn append_image_ref(&self, image_ref: &str) -> CacheResult<()> {
        let mut refs = self.get_image_refs()?;
        if refs.iter().any(|r| r == image_ref) {
            return Ok(());
        }
        refs.push(image_ref.to_string());
        self.queue_field("imageRefs", &refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MetadataStore {
        MetadataStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn test_queue_is_invisible_until_commit() {
        let store = store();
        let md = store.metadata("r1");
        md.queue_description(&"hello".to_string()).unwrap();
        assert_eq!(md.get_description().unwrap(), None);
        md.commit_metadata().unwrap();
        assert_eq!(md.get_description().unwrap(), Some("hello".to_string()));
    }

    #[test]
    fn test_all_ids_and_exists() {
        let store = store();
        for id in ["a", "b"] {
            let md = store.metadata(id);
            md.queue_committed(&true).unwrap();
            md.commit_metadata().unwrap();
        }
        assert_eq!(store.all_ids().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(store.exists("a").unwrap());
        assert!(!store.exists("c").unwrap());
    }

    #[test]
    fn test_chain_index_lifecycle() {
        let store = store();
        let chain = Digest::from_bytes(b"chain");
        let md = store.metadata("r1");
        md.queue_chain_id(&chain).unwrap();
        md.commit_metadata().unwrap();

        assert_eq!(store.search_chain(&chain).unwrap(), vec!["r1".to_string()]);

        store.clear("r1").unwrap();
        assert!(store.search_chain(&chain).unwrap().is_empty());
        assert!(!store.exists("r1").unwrap());
    }

    #[test]
    fn test_size_defaults_to_unknown() {
        let store = store();
        let md = store.metadata("r1");
        assert_eq!(md.get_size().unwrap(), SIZE_UNKNOWN);
        md.queue_size(42).unwrap();
        md.commit_metadata().unwrap();
        assert_eq!(md.get_size().unwrap(), 42);
    }

    #[test]
    fn test_last_used_updates_immediately() {
        let store = store();
        let md = store.metadata("r1");
        assert_eq!(md.get_last_used().unwrap().0, 0);
        md.update_last_used().unwrap();
        md.update_last_used().unwrap();
        let (count, at) = md.get_last_used().unwrap();
        assert_eq!(count, 2);
        assert!(at.is_some());
    }

    #[test]
    fn test_created_at_roundtrip() {
        let store = store();
        let md = store.metadata("r1");
        let t = UNIX_EPOCH + Duration::from_nanos(1_234_567_890_123);
        md.queue_created_at(t).unwrap();
        md.commit_metadata().unwrap();
        assert_eq!(md.get_created_at().unwrap(), Some(t));
    }

    #[test]
    fn test_image_refs_deduplicate() {
        let store = store();
        let md = store.metadata("r1");
        md.append_image_ref("img:a").unwrap();
        md.commit_metadata().unwrap();
        md.append_image_ref("img:a").unwrap();
        md.append_image_ref("img:b").unwrap();
        md.commit_metadata().unwrap();
        assert_eq!(md.get_image_refs().unwrap(), vec!["img:a".to_string(), "img:b".to_string()]);
    }

    #[test]
    fn test_cache_policy_default() {
        let store = store();
        let md = store.metadata("r1");
        assert!(!md.has_cache_policy_retain().unwrap());
        md.queue_cache_policy(&CachePolicy::Retain).unwrap();
        md.commit_metadata().unwrap();
        assert!(md.has_cache_policy_retain().unwrap());
    }
}
