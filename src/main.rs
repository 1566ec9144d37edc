use mission_api::{HttpRemoteApi, RemoteApi, StaticToken};
use mission_sync::models::{FailureKind, SyncTrigger};
use mission_sync::services::{
    spawn_probe, spawn_sync_trigger, Availability, CacheInvalidationBridge, ConnectivityMonitor,
    LocalStore, MemoryQueryCache, SyncEvent, SyncManager,
};
use mission_sync::{AppError, SyncConfig};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "mission-sync.toml";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = SyncConfig::load(&config_path)?;

    let store = LocalStore::new();
    match store
        .init(&config.database_path, config.store_open_timeout())
        .await
    {
        Availability::Ready => log::info!("Local store ready"),
        Availability::Unavailable(reason) => {
            log::error!("Offline features unavailable: {}", reason)
        }
        Availability::Initializing => {}
    }

    let tokens = Arc::new(StaticToken::new(config.api_token.clone()));
    let api: Arc<dyn RemoteApi> = Arc::new(
        HttpRemoteApi::new(&config.api_base_url, tokens, config.request_timeout())
            .map_err(|e| AppError::Config(e.to_string()))?,
    );

    let monitor = ConnectivityMonitor::new(false);
    let manager = SyncManager::new(store.clone(), api.clone(), monitor.clone(), &config);

    let bridge = Arc::new(CacheInvalidationBridge::new(Arc::new(MemoryQueryCache::new())));
    let _cache_subscription = bridge.attach(&manager);
    let _log_subscription = manager.on_sync_status_change(|event| match event {
        SyncEvent::Status(state) => log::debug!("Sync status: {}", state.as_str()),
        SyncEvent::Finished(result) => {
            for failure in result
                .failures
                .iter()
                .filter(|failure| failure.kind != FailureKind::Transient)
            {
                log::warn!(
                    "Report {} needs attention ({}): {}",
                    failure.report_id,
                    failure.operation.as_str(),
                    failure.reason
                );
            }
        }
    });

    let probe = spawn_probe(monitor.clone(), api, config.probe_interval());
    let trigger = spawn_sync_trigger(&monitor, manager.clone(), config.connectivity_quiet_window());
    let periodic = manager.spawn_periodic(config.sync_interval());

    log::info!(
        "Mission sync running against {} (Ctrl-C to stop)",
        config.api_base_url
    );
    tokio::signal::ctrl_c().await?;

    log::info!("Shutting down");
    probe.abort();
    trigger.abort();
    periodic.abort();

    // Let a running cycle settle instead of cutting requests off
    if manager.is_syncing() {
        manager.sync(SyncTrigger::Manual).await;
    }

    let snapshot = manager.snapshot();
    log::info!(
        "{} entries pending, {} failed",
        snapshot.pending_count,
        snapshot.failed_count
    );
    Ok(())
}
