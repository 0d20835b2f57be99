//! Lease manager contract.
//!
//! A lease groups resources (snapshot keys, blob digests) that must survive
//! background garbage collection. Every cache record owns one persistent
//! lease whose id equals the record id; short-lived operations use ephemeral
//! leases labelled with [`GC_FLAT_LABEL`].

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{SnapshotError, SnapshotResult};

/// Label marking a lease as flat/ephemeral; the value is a creation
/// timestamp in unix nanoseconds.
pub const GC_FLAT_LABEL: &str = "containerd.io/gc.flat";

/// A lease handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Lease id.
    pub id: String,
    /// Labels attached at creation.
    pub labels: HashMap<String, String>,
}

/// A resource protected by a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    /// Resource id: a snapshot key or a blob digest.
    pub id: String,
    /// Resource kind, e.g. `snapshots/native` or `content`.
    pub kind: String,
}

/// Callback invoked when a resource loses its last lease.
pub type ReleaseHook = Box<dyn Fn(&Resource) + Send + Sync>;

/// Contract for lease management.
pub trait LeaseManager: Send + Sync {
    /// Creates a lease. Fails with `AlreadyExists` for duplicate ids.
    fn create(&self, id: &str, labels: HashMap<String, String>) -> SnapshotResult<Lease>;

    /// Attaches a resource to a lease. Fails with `AlreadyExists` when the
    /// exact resource is already attached.
    fn add_resource(&self, lease_id: &str, resource: Resource) -> SnapshotResult<()>;

    /// Deletes a lease, releasing its resources.
    fn delete(&self, lease_id: &str) -> SnapshotResult<()>;

    /// Returns true if the lease exists.
    fn contains(&self, lease_id: &str) -> bool;

    /// Lists all leases.
    fn list(&self) -> Vec<Lease>;

    /// Lists the resources attached to a lease.
    fn resources(&self, lease_id: &str) -> SnapshotResult<Vec<Resource>>;
}

/// Returns the ephemeral-lease label set with a current timestamp value.
pub fn flat_lease_labels() -> HashMap<String, String> {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    HashMap::from([(GC_FLAT_LABEL.to_string(), nanos.to_string())])
}

#[derive(Default)]
struct LeaseTable {
    leases: HashMap<String, (HashMap<String, String>, Vec<Resource>)>,
}

/// In-memory lease manager.
///
/// When a resource loses its last lease the release hook runs, giving the
/// composition root a place to delete the underlying snapshot or blob.
#[derive(Default)]
pub struct MemoryLeaseManager {
    table: Mutex<LeaseTable>,
    hook: Mutex<Option<ReleaseHook>>,
}

impl MemoryLeaseManager {
    /// Creates an empty lease manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the resource release hook.
    pub fn set_release_hook(&self, hook: ReleaseHook) {
        *self.hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }
}

impl LeaseManager for MemoryLeaseManager {
    fn create(&self, id: &str, labels: HashMap<String, String>) -> SnapshotResult<Lease> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.leases.contains_key(id) {
            return Err(SnapshotError::AlreadyExists { key: id.to_string() });
        }
        table
            .leases
            .insert(id.to_string(), (labels.clone(), Vec::new()));
        debug!(lease = %id, "created lease");
        Ok(Lease { id: id.to_string(), labels })
    }

    fn add_resource(&self, lease_id: &str, resource: Resource) -> SnapshotResult<()> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let (_, resources) = table
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| SnapshotError::NotFound { key: lease_id.to_string() })?;
        if resources.contains(&resource) {
            return Err(SnapshotError::AlreadyExists {
                key: format!("{}/{}", lease_id, resource.id),
            });
        }
        debug!(lease = %lease_id, resource = %resource.id, kind = %resource.kind, "added lease resource");
        resources.push(resource);
        Ok(())
    }

    fn delete(&self, lease_id: &str) -> SnapshotResult<()> {
        let released = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            let (_, resources) = table
                .leases
                .remove(lease_id)
                .ok_or_else(|| SnapshotError::NotFound { key: lease_id.to_string() })?;
            let still_referenced: std::collections::HashSet<&Resource> = table
                .leases
                .values()
                .flat_map(|(_, rs)| rs.iter())
                .collect();
            resources
                .into_iter()
                .filter(|r| !still_referenced.contains(r))
                .collect::<Vec<_>>()
        };
        debug!(lease = %lease_id, released = released.len(), "deleted lease");
        // Run the hook outside the table lock; it may call back into other
        // subsystems.
        let hook = self.hook.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hook) = hook.as_ref() {
            for resource in &released {
                hook(resource);
            }
        }
        Ok(())
    }

    fn contains(&self, lease_id: &str) -> bool {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.leases.contains_key(lease_id)
    }

    fn list(&self) -> Vec<Lease> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .leases
            .iter()
            .map(|(id, (labels, _))| Lease { id: id.clone(), labels: labels.clone() })
            .collect()
    }

    fn resources(&self, lease_id: &str) -> SnapshotResult<Vec<Resource>> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .leases
            .get(lease_id)
            .map(|(_, rs)| rs.clone())
            .ok_or_else(|| SnapshotError::NotFound { key: lease_id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn res(id: &str) -> Resource {
        Resource { id: id.to_string(), kind: "content".to_string() }
    }

    #[test]
    fn test_create_and_duplicate() {
        let lm = MemoryLeaseManager::new();
        lm.create("l1", HashMap::new()).unwrap();
        assert!(lm.contains("l1"));
        let err = lm.create("l1", HashMap::new()).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_delete_releases_unreferenced_resources() {
        let lm = MemoryLeaseManager::new();
        let released = Arc::new(AtomicUsize::new(0));
        let released2 = released.clone();
        lm.set_release_hook(Box::new(move |_| {
            released2.fetch_add(1, Ordering::SeqCst);
        }));

        lm.create("l1", HashMap::new()).unwrap();
        lm.create("l2", HashMap::new()).unwrap();
        lm.add_resource("l1", res("shared")).unwrap();
        lm.add_resource("l2", res("shared")).unwrap();
        lm.add_resource("l1", res("own")).unwrap();

        lm.delete("l1").unwrap();
        // "shared" is still held by l2; only "own" is released.
        assert_eq!(released.load(Ordering::SeqCst), 1);

        lm.delete("l2").unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let lm = MemoryLeaseManager::new();
        lm.create("l1", HashMap::new()).unwrap();
        lm.add_resource("l1", res("r")).unwrap();
        let err = lm.add_resource("l1", res("r")).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_delete_missing_lease() {
        let lm = MemoryLeaseManager::new();
        assert!(lm.delete("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_flat_lease_labels() {
        let labels = flat_lease_labels();
        assert!(labels.contains_key(GC_FLAT_LABEL));
    }
}
