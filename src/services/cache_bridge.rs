use crate::models::{FailureKind, SyncResult};
use crate::services::sync_manager::{Subscription, SyncEvent, SyncManager};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Identifies one cached UI query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKey {
    ReportList,
    Report(Uuid),
    ReportPhotos(Uuid),
    /// Anything not derived from reports (worker lists, settings...)
    Other(String),
}

/// The UI's query cache as seen by the sync engine
pub trait QueryCache: Send + Sync {
    /// Marks one query stale; returns whether it was cached
    fn invalidate(&self, key: &QueryKey) -> bool;

    /// Drops everything
    fn clear(&self);
}

/// Simple in-memory query cache
#[derive(Default)]
pub struct MemoryQueryCache {
    entries: Mutex<HashMap<QueryKey, serde_json::Value>>,
}

impl MemoryQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, serde_json::Value>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, key: QueryKey, value: serde_json::Value) {
        self.entries().insert(key, value);
    }

    pub fn get(&self, key: &QueryKey) -> Option<serde_json::Value> {
        self.entries().get(key).cloned()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl QueryCache for MemoryQueryCache {
    fn invalidate(&self, key: &QueryKey) -> bool {
        self.entries().remove(key).is_some()
    }

    fn clear(&self) {
        self.entries().clear();
    }
}

/// Invalidates the cached queries touched by a drain cycle
pub struct CacheInvalidationBridge {
    cache: Arc<dyn QueryCache>,
}

impl CacheInvalidationBridge {
    pub fn new(cache: Arc<dyn QueryCache>) -> Self {
        Self { cache }
    }

    /// Queries affected by the reports that changed in `result`
    pub fn keys_for(result: &SyncResult) -> BTreeSet<QueryKey> {
        let mut keys = BTreeSet::new();

        for id in &result.synced_reports {
            keys.insert(QueryKey::Report(*id));
        }
        for id in &result.photo_reports {
            keys.insert(QueryKey::Report(*id));
            keys.insert(QueryKey::ReportPhotos(*id));
        }
        for id in &result.deleted_reports {
            keys.insert(QueryKey::Report(*id));
            keys.insert(QueryKey::ReportPhotos(*id));
        }
        // Settled failures change the local sync status; transient ones leave it pending
        for failure in &result.failures {
            if failure.kind != FailureKind::Transient {
                keys.insert(QueryKey::Report(failure.report_id));
            }
        }
        if !keys.is_empty() {
            keys.insert(QueryKey::ReportList);
        }

        keys
    }

    /// Invalidates exactly the affected queries and returns their keys.
    ///
    /// Aborted cycles are applied too; entries synced before the abort changed remote state.
    pub fn apply(&self, result: &SyncResult) -> BTreeSet<QueryKey> {
        let keys = Self::keys_for(result);
        for key in &keys {
            self.cache.invalidate(key);
        }
        if !keys.is_empty() {
            log::debug!("Invalidated {} cached queries after sync", keys.len());
        }
        keys
    }

    /// Applies every finished cycle of `manager` until the subscription is dropped
    pub fn attach(self: &Arc<Self>, manager: &SyncManager) -> Subscription {
        let bridge = Arc::clone(self);
        manager.on_sync_status_change(move |event| {
            if let SyncEvent::Finished(result) = event {
                bridge.apply(result);
            }
        })
    }

    /// Everything cached may belong to the previous user
    pub fn on_sign_out(&self) {
        log::info!("Signed out, clearing query cache");
        self.cache.clear();
    }
}
