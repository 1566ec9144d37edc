pub mod backoff;
pub mod cache_bridge;
pub mod connectivity;
pub mod report_store;
pub mod sync_manager;
pub mod sync_queue;

pub use cache_bridge::{CacheInvalidationBridge, MemoryQueryCache, QueryCache, QueryKey};
pub use connectivity::{spawn_probe, spawn_sync_trigger, ConnectivityMonitor};
pub use report_store::{Availability, LocalStore};
pub use sync_manager::{DispatchOutcome, Subscription, SyncEvent, SyncManager};
