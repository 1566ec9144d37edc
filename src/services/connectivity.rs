use crate::models::SyncTrigger;
use crate::services::sync_manager::SyncManager;
use mission_api::RemoteApi;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Online/offline state fed by the platform (or by [`spawn_probe`])
///
/// Subscribers are only woken when the value actually flips.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Records the current state; returns true if this was a transition
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Triggers a connectivity sync on every offline→online edge that stays
/// online for `quiet_window`. A zero window triggers immediately.
pub fn spawn_sync_trigger(
    monitor: &ConnectivityMonitor,
    manager: SyncManager,
    quiet_window: Duration,
) -> JoinHandle<()> {
    let mut rx = monitor.subscribe();

    tokio::spawn(async move {
        let mut online = *rx.borrow_and_update();

        loop {
            if rx.changed().await.is_err() {
                return;
            }
            let now_online = *rx.borrow_and_update();
            let came_online = now_online && !online;
            online = now_online;
            if !came_online {
                continue;
            }

            // Every flap restarts the quiet window
            loop {
                match tokio::time::timeout(quiet_window, rx.changed()).await {
                    Err(_) => break,
                    Ok(Err(_)) => return,
                    Ok(Ok(())) => {
                        online = *rx.borrow_and_update();
                        if !online {
                            break;
                        }
                    }
                }
            }

            if online {
                log::debug!("Connection stable for {:?}, syncing", quiet_window);
                let result = manager.sync(SyncTrigger::Connectivity).await;
                log::debug!(
                    "Connectivity sync finished: {} ok, {} failed",
                    result.succeeded,
                    result.failed
                );
            } else {
                log::debug!("Connection dropped within quiet window, no sync");
            }
        }
    })
}

/// Pings the backend every `interval` and feeds reachability into the monitor.
///
/// Any answer from the server, even an error status, counts as online.
pub fn spawn_probe(
    monitor: ConnectivityMonitor,
    api: Arc<dyn RemoteApi>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let online = match api.ping().await {
                Ok(()) => true,
                Err(e) if e.is_connectivity() => {
                    log::debug!("Health probe failed: {}", e);
                    false
                }
                Err(e) => {
                    log::debug!("Health probe answered with error: {}", e);
                    true
                }
            };
            monitor.set_online(online);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mission_api::{ApiError, PhotoUpload, RemoteReport, UploadedPhoto};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_set_online_reports_edges_only() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(!monitor.is_online());
        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());
        assert!(monitor.set_online(false));
    }

    #[tokio::test]
    async fn test_subscribers_not_woken_without_change() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());

        monitor.set_online(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
    }

    struct ReachableApi {
        reachable: AtomicBool,
    }

    #[async_trait]
    impl RemoteApi for ReachableApi {
        async fn create_report(
            &self,
            id: &str,
            _payload: &serde_json::Value,
        ) -> Result<RemoteReport, ApiError> {
            Ok(RemoteReport {
                id: id.to_string(),
                updated_at: None,
            })
        }

        async fn update_report(
            &self,
            id: &str,
            _payload: &serde_json::Value,
        ) -> Result<RemoteReport, ApiError> {
            Ok(RemoteReport {
                id: id.to_string(),
                updated_at: None,
            })
        }

        async fn delete_report(&self, _id: &str) -> Result<(), ApiError> {
            Ok(())
        }

        async fn upload_photo(&self, upload: &PhotoUpload) -> Result<UploadedPhoto, ApiError> {
            Ok(UploadedPhoto {
                url: upload.file_name(),
            })
        }

        async fn ping(&self) -> Result<(), ApiError> {
            if self.reachable.load(Ordering::SeqCst) {
                Err(ApiError::Status {
                    status: 503,
                    body: String::new(),
                })
            } else {
                Err(ApiError::Network("connection refused".to_string()))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_feeds_monitor() {
        let monitor = ConnectivityMonitor::new(true);
        let api = Arc::new(ReachableApi {
            reachable: AtomicBool::new(false),
        });
        let handle = spawn_probe(monitor.clone(), api.clone(), Duration::from_secs(15));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.is_online());

        // A 503 still proves the server is reachable
        api.reachable.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(monitor.is_online());

        handle.abort();
    }
}
