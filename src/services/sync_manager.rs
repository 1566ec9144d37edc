//! Drives the sync queue against the remote API.
//!
//! One drain cycle runs at a time; concurrent `sync()` calls join the running
//! cycle and receive the same [`SyncResult`]. Within a cycle, entries are
//! grouped per report and each report's chain is drained in FIFO order, with
//! up to `max_concurrent_reports` chains in flight.

use crate::config::SyncConfig;
use crate::error::AppError;
use crate::models::{
    AbortReason, EntryState, FailureKind, PhotoUploadPayload, RemoteEffect, ReportPayload,
    SyncFailure, SyncOperation, SyncQueueEntry, SyncResult, SyncSnapshot, SyncState, SyncTrigger,
};
use crate::services::backoff::Backoff;
use crate::services::connectivity::ConnectivityMonitor;
use crate::services::report_store::{Availability, LocalStore};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use mission_api::{ApiError, PhotoUpload, RemoteApi};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use uuid::Uuid;

/// Results kept for the session log
const HISTORY_LIMIT: usize = 500;

/// Outcome of dispatching one queue entry
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success(RemoteEffect),
    /// Retry later with backoff
    Transient(String),
    /// Needs user action
    Permanent(String),
    /// Credential rejected; the auth collaborator has been notified
    Unauthorized,
    /// The entry can never succeed and is dropped
    Integrity(String),
}

impl From<ApiError> for DispatchOutcome {
    fn from(e: ApiError) -> Self {
        if matches!(e, ApiError::Unauthorized) {
            DispatchOutcome::Unauthorized
        } else if e.is_transient() {
            DispatchOutcome::Transient(e.to_string())
        } else {
            DispatchOutcome::Permanent(e.to_string())
        }
    }
}

/// Delivered to status subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Status(SyncState),
    Finished(Arc<SyncResult>),
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: BTreeMap<u64, Listener>,
}

struct InFlight {
    generation: u64,
    result: Shared<BoxFuture<'static, Arc<SyncResult>>>,
}

enum ChainStep {
    Continue,
    Stop,
}

struct Inner {
    store: LocalStore,
    api: Arc<dyn RemoteApi>,
    monitor: ConnectivityMonitor,
    backoff: Backoff,
    request_timeout: Duration,
    max_attempts: u32,
    max_concurrent_reports: usize,
    in_flight: Mutex<Option<InFlight>>,
    generation: AtomicU64,
    listeners: Mutex<Listeners>,
    snapshot: watch::Sender<SyncSnapshot>,
    history: Mutex<VecDeque<Arc<SyncResult>>>,
    next_sync_at: Mutex<Option<Instant>>,
}

/// Handle to the sync state machine; clones share the same state
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

/// Keeps a status callback registered until disposed or dropped
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
    active: bool,
}

impl Subscription {
    /// Unregisters the callback; further calls are no-ops
    pub fn dispose(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.listeners).entries.remove(&self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SyncManager {
    pub fn new(
        store: LocalStore,
        api: Arc<dyn RemoteApi>,
        monitor: ConnectivityMonitor,
        config: &SyncConfig,
    ) -> Self {
        let (snapshot, _rx) = watch::channel(SyncSnapshot {
            online: monitor.is_online(),
            ..Default::default()
        });

        Self {
            inner: Arc::new(Inner {
                store,
                api,
                monitor,
                backoff: Backoff::new(
                    Duration::from_secs(config.retry_base_secs),
                    Duration::from_secs(config.retry_max_secs),
                ),
                request_timeout: config.request_timeout(),
                max_attempts: config.max_attempts.max(1),
                max_concurrent_reports: config.max_concurrent_reports.max(1),
                in_flight: Mutex::new(None),
                generation: AtomicU64::new(0),
                listeners: Mutex::new(Listeners::default()),
                snapshot,
                history: Mutex::new(VecDeque::new()),
                next_sync_at: Mutex::new(None),
            }),
        }
    }

    /// Runs a drain cycle, or joins the one already running
    pub async fn sync(&self, trigger: SyncTrigger) -> Arc<SyncResult> {
        let result = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some(running) => {
                    log::debug!("Sync already running, joining it ({:?})", trigger);
                    running.result.clone()
                }
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let inner = self.inner.clone();
                    let handle = tokio::spawn(inner.clone().run_cycle(trigger, generation));

                    let result = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => inner.cycle_died(trigger, generation, e),
                        }
                    }
                    .boxed()
                    .shared();

                    *slot = Some(InFlight {
                        generation,
                        result: result.clone(),
                    });
                    result
                }
            }
        };

        result.await
    }

    pub fn is_syncing(&self) -> bool {
        lock(&self.inner.in_flight).is_some()
    }

    /// Registers a callback for state transitions and cycle results.
    ///
    /// Callbacks run synchronously on the drain task and must not block.
    pub fn on_sync_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.inner.listeners);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.insert(id, Arc::new(callback));

        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.listeners).entries.len()
    }

    /// Current status with fresh queue counts
    pub fn snapshot(&self) -> SyncSnapshot {
        self.inner.refresh_snapshot();
        self.inner.snapshot.borrow().clone()
    }

    /// Status stream updated on every transition (and by [`Self::refresh_snapshot`])
    pub fn watch_snapshot(&self) -> watch::Receiver<SyncSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Re-reads queue counts and connectivity, e.g. after a local edit
    pub fn refresh_snapshot(&self) {
        self.inner.refresh_snapshot();
    }

    pub fn last_result(&self) -> Option<Arc<SyncResult>> {
        lock(&self.inner.history).back().cloned()
    }

    /// Results of this session, oldest first
    pub fn history(&self) -> Vec<Arc<SyncResult>> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    /// Time until the periodic scheduler fires, `None` if it is not running
    pub fn next_sync_eta(&self) -> Option<Duration> {
        lock(&self.inner.next_sync_at).map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Syncs every `interval` while online; abort the handle to stop
    pub fn spawn_periodic(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        log::info!("Starting periodic sync every {:?}", interval);

        tokio::spawn(async move {
            loop {
                *lock(&manager.inner.next_sync_at) = Some(Instant::now() + interval);
                tokio::time::sleep(interval).await;

                if !manager.inner.monitor.is_online() {
                    log::debug!("Offline, skipping periodic sync");
                    continue;
                }
                manager.sync(SyncTrigger::Periodic).await;
            }
        })
    }

    /// Puts a report's failed entries back into rotation and syncs
    pub async fn retry_report(&self, report_id: Uuid) -> Result<Arc<SyncResult>, AppError> {
        let count = self.inner.store.retry_report(report_id)?;
        log::info!("Retrying {} failed entries for report {}", count, report_id);
        Ok(self.sync(SyncTrigger::Manual).await)
    }

    /// Gives up on a report's failed entries
    pub fn discard_failed(&self, report_id: Uuid) -> Result<usize, AppError> {
        let count = self.inner.store.discard_failed(report_id)?;
        self.inner.refresh_snapshot();
        Ok(count)
    }
}

impl Inner {
    async fn run_cycle(self: Arc<Self>, trigger: SyncTrigger, generation: u64) -> Arc<SyncResult> {
        log::info!("Sync started ({:?})", trigger);
        self.transition(SyncState::Syncing);

        let mut result = self.drain(trigger).await;
        result.finished_at = Utc::now();
        let result = Arc::new(result);

        match &result.aborted {
            None => log::info!(
                "Sync completed: {} succeeded, {} failed, {} deferred",
                result.succeeded,
                result.failed,
                result.deferred
            ),
            Some(reason) => log::warn!(
                "Sync failed ({}): {} succeeded, {} failed, {} deferred",
                reason,
                result.succeeded,
                result.failed,
                result.deferred
            ),
        }

        self.finish(generation, result.clone());
        result
    }

    fn cycle_died(&self, trigger: SyncTrigger, generation: u64, e: JoinError) -> Arc<SyncResult> {
        log::error!("Sync task died: {}", e);
        let result = Arc::new(SyncResult::aborted(
            trigger,
            AbortReason::Interrupted(e.to_string()),
        ));
        self.finish(generation, result.clone());
        result
    }

    fn finish(&self, generation: u64, result: Arc<SyncResult>) {
        {
            let mut slot = lock(&self.in_flight);
            if slot.as_ref().map(|running| running.generation) == Some(generation) {
                *slot = None;
            }
        }

        {
            let mut history = lock(&self.history);
            history.push_back(result.clone());
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }

        self.transition(result.state());
        self.emit(&SyncEvent::Finished(result));
        self.transition(SyncState::Idle);
    }

    fn transition(&self, state: SyncState) {
        log::debug!("Sync state: {}", state.as_str());
        self.snapshot.send_modify(|snapshot| snapshot.state = state);
        self.refresh_snapshot();
        self.emit(&SyncEvent::Status(state));
    }

    fn refresh_snapshot(&self) {
        let pending_count = self.store.pending_count().unwrap_or_else(|e| {
            log::warn!("Could not count pending entries: {}", e);
            0
        });
        let failed_count = self.store.failed_count().unwrap_or_else(|e| {
            log::warn!("Could not count failed entries: {}", e);
            0
        });
        let last_result = lock(&self.history).back().cloned();
        let online = self.monitor.is_online();

        self.snapshot.send_modify(|snapshot| {
            snapshot.pending_count = pending_count;
            snapshot.failed_count = failed_count;
            snapshot.last_result = last_result;
            snapshot.online = online;
        });
    }

    fn emit(&self, event: &SyncEvent) {
        // Callbacks may (un)subscribe, so call them without holding the lock
        let listeners: Vec<Listener> = lock(&self.listeners).entries.values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    async fn drain(self: &Arc<Self>, trigger: SyncTrigger) -> SyncResult {
        let mut result = SyncResult::new(trigger);

        match self.store.availability() {
            Availability::Ready => {}
            Availability::Initializing => {
                result.aborted = Some(AbortReason::StoreUnavailable(
                    "store is still initializing".to_string(),
                ));
                return result;
            }
            Availability::Unavailable(reason) => {
                result.aborted = Some(AbortReason::StoreUnavailable(reason));
                return result;
            }
        }

        if !self.monitor.is_online() {
            result.aborted = Some(AbortReason::Offline);
            return result;
        }

        let queue = self.store.list_pending().and_then(|pending| {
            let mut held = self.store.list_terminal()?;
            held.extend(self.store.list_in_flight()?);
            Ok((pending, held))
        });
        let (pending, held) = match queue {
            Ok(queue) => queue,
            Err(e) => {
                log::error!("Could not read sync queue: {}", e);
                result.aborted = Some(AbortReason::StoreUnavailable(e.to_string()));
                return result;
            }
        };

        // A failed or unsettled entry holds back everything queued after it for that report
        let blocked: HashSet<Uuid> = held.iter().map(|entry| entry.report_id).collect();
        for entry in held.iter().filter(|entry| entry.state == EntryState::InFlight) {
            log::warn!(
                "Entry {} for report {} is still in flight, holding its report back",
                entry.id,
                entry.report_id
            );
        }

        let mut chains: Vec<(Uuid, Vec<SyncQueueEntry>)> = Vec::new();
        let mut chain_index: HashMap<Uuid, usize> = HashMap::new();
        for entry in pending {
            if blocked.contains(&entry.report_id) {
                result.deferred += 1;
                continue;
            }
            match chain_index.get(&entry.report_id) {
                Some(&index) => chains[index].1.push(entry),
                None => {
                    chain_index.insert(entry.report_id, chains.len());
                    chains.push((entry.report_id, vec![entry]));
                }
            }
        }

        if chains.is_empty() {
            return result;
        }
        log::debug!("Draining {} report chains", chains.len());

        let stop = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for (report_id, entries) in chains {
            while tasks.len() >= self.max_concurrent_reports {
                if let Some(joined) = tasks.join_next().await {
                    merge_chain(&mut result, joined);
                }
            }
            if stop.load(Ordering::SeqCst) {
                result.deferred += entries.len();
                continue;
            }
            tasks.spawn(self.clone().drain_chain(report_id, entries, trigger, stop.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            merge_chain(&mut result, joined);
        }

        result
    }

    /// Drains one report's entries strictly in order
    async fn drain_chain(
        self: Arc<Self>,
        report_id: Uuid,
        entries: Vec<SyncQueueEntry>,
        trigger: SyncTrigger,
        stop: Arc<AtomicBool>,
    ) -> SyncResult {
        let mut result = SyncResult::new(trigger);
        let now = Utc::now();
        let total = entries.len();

        for (index, listed) in entries.into_iter().enumerate() {
            let remaining = total - index;

            if stop.load(Ordering::SeqCst) {
                result.deferred += remaining;
                break;
            }

            if trigger.respects_backoff() && !listed.is_due(now) {
                log::debug!(
                    "Report {} waits for backoff until {:?}",
                    report_id,
                    listed.next_attempt_at
                );
                result.deferred += remaining;
                break;
            }

            if !self.monitor.is_online() {
                stop.store(true, Ordering::SeqCst);
                result.aborted.get_or_insert(AbortReason::Offline);
                result.deferred += remaining;
                break;
            }

            let entry = match self.store.mark_in_flight(&listed.id) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    log::debug!("Entry {} was superseded, skipping", listed.id);
                    continue;
                }
                Err(e) => {
                    log::error!("Could not claim entry {}: {}", listed.id, e);
                    stop.store(true, Ordering::SeqCst);
                    result
                        .aborted
                        .get_or_insert(AbortReason::StoreUnavailable(e.to_string()));
                    result.deferred += remaining;
                    break;
                }
            };

            let outcome = match self.dispatch(&entry).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("Could not prepare entry {}: {}", entry.id, e);
                    self.release(&entry);
                    stop.store(true, Ordering::SeqCst);
                    result
                        .aborted
                        .get_or_insert(AbortReason::StoreUnavailable(e.to_string()));
                    result.deferred += remaining;
                    break;
                }
            };

            if let ChainStep::Stop = self.settle(&entry, outcome, &mut result, &stop) {
                result.deferred += remaining - 1;
                break;
            }
        }

        result
    }

    /// Sends one entry to the server
    async fn dispatch(&self, entry: &SyncQueueEntry) -> Result<DispatchOutcome, AppError> {
        let report_id = entry.report_id.to_string();

        match entry.operation {
            SyncOperation::Create | SyncOperation::Update => {
                if !self.store.exists(entry.report_id)? {
                    return Ok(DispatchOutcome::Integrity(format!(
                        "report {} no longer exists locally",
                        report_id
                    )));
                }
                if let Err(e) = ReportPayload::from_json(&entry.payload) {
                    return Ok(DispatchOutcome::Integrity(format!(
                        "undecodable report payload: {}",
                        e
                    )));
                }

                let saved = if entry.operation == SyncOperation::Create {
                    match self
                        .bounded(self.api.create_report(&report_id, &entry.payload))
                        .await
                    {
                        // Created by an earlier attempt whose answer was lost
                        Err(e) if e.is_conflict() => {
                            log::info!("Report {} already exists remotely, updating", report_id);
                            self.bounded(self.api.update_report(&report_id, &entry.payload))
                                .await
                        }
                        other => other,
                    }
                } else {
                    self.bounded(self.api.update_report(&report_id, &entry.payload))
                        .await
                };

                Ok(match saved {
                    Ok(remote) => DispatchOutcome::Success(RemoteEffect::ReportSaved {
                        remote_updated_at: remote.updated_at,
                    }),
                    Err(e) => e.into(),
                })
            }
            SyncOperation::Delete => {
                Ok(match self.bounded(self.api.delete_report(&report_id)).await {
                    Ok(()) => DispatchOutcome::Success(RemoteEffect::ReportDeleted),
                    Err(e) if e.is_not_found() => {
                        log::debug!("Report {} was already gone remotely", report_id);
                        DispatchOutcome::Success(RemoteEffect::ReportDeleted)
                    }
                    Err(e) => e.into(),
                })
            }
            SyncOperation::UploadPhoto => {
                let payload: PhotoUploadPayload =
                    match serde_json::from_value(entry.payload.clone()) {
                        Ok(payload) => payload,
                        Err(e) => {
                            return Ok(DispatchOutcome::Integrity(format!(
                                "undecodable photo payload: {}",
                                e
                            )))
                        }
                    };

                let Some(photo) = self.store.get_photo(payload.photo_id)? else {
                    return Ok(DispatchOutcome::Integrity(format!(
                        "photo {} no longer exists",
                        payload.photo_id
                    )));
                };
                if let Some(url) = photo.remote_url {
                    return Ok(DispatchOutcome::Success(RemoteEffect::PhotoUploaded {
                        photo_id: photo.id,
                        url,
                    }));
                }
                let Some(data) = self.store.photo_blob(photo.id)? else {
                    return Ok(DispatchOutcome::Integrity(format!(
                        "photo {} has no local data",
                        photo.id
                    )));
                };

                let upload = PhotoUpload {
                    report_id,
                    photo_id: photo.id.to_string(),
                    kind: photo.kind.as_str().to_string(),
                    order: photo.order,
                    checksum: photo.checksum,
                    content_type: photo.content_type,
                    data,
                };

                Ok(match self.bounded(self.api.upload_photo(&upload)).await {
                    Ok(uploaded) => DispatchOutcome::Success(RemoteEffect::PhotoUploaded {
                        photo_id: photo.id,
                        url: uploaded.url,
                    }),
                    Err(e) => e.into(),
                })
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        }
    }

    /// Writes the outcome back to the store and decides whether the chain goes on
    fn settle(
        &self,
        entry: &SyncQueueEntry,
        outcome: DispatchOutcome,
        result: &mut SyncResult,
        stop: &AtomicBool,
    ) -> ChainStep {
        match outcome {
            DispatchOutcome::Success(effect) => {
                if let Err(e) = self.store.complete_entry(entry, &effect) {
                    log::error!("Could not record success of entry {}: {}", entry.id, e);
                    self.release(entry);
                    stop.store(true, Ordering::SeqCst);
                    result
                        .aborted
                        .get_or_insert(AbortReason::StoreUnavailable(e.to_string()));
                    result.deferred += 1;
                    return ChainStep::Stop;
                }

                log::debug!(
                    "Synced {} for report {}",
                    entry.operation.as_str(),
                    entry.report_id
                );
                result.succeeded += 1;
                match effect {
                    RemoteEffect::ReportSaved { .. } => {
                        result.synced_reports.insert(entry.report_id);
                    }
                    RemoteEffect::PhotoUploaded { .. } => {
                        result.photo_reports.insert(entry.report_id);
                    }
                    RemoteEffect::ReportDeleted => {
                        result.deleted_reports.insert(entry.report_id);
                    }
                }
                ChainStep::Continue
            }
            DispatchOutcome::Transient(reason) => {
                let attempts = entry.attempt_count + 1;
                let kind = if attempts >= self.max_attempts {
                    log::error!(
                        "Giving up on {} for report {} after {} attempts: {}",
                        entry.operation.as_str(),
                        entry.report_id,
                        attempts,
                        reason
                    );
                    let message = format!("{} (gave up after {} attempts)", reason, attempts);
                    if let Err(e) = self.store.mark_terminal(entry, &message) {
                        log::error!("Could not mark entry {} as failed: {}", entry.id, e);
                        self.release(entry);
                    }
                    FailureKind::Permanent
                } else {
                    let next_attempt_at = self.backoff.next_attempt_at(attempts);
                    log::warn!(
                        "{} for report {} failed (attempt {}), retrying after {}: {}",
                        entry.operation.as_str(),
                        entry.report_id,
                        attempts,
                        next_attempt_at,
                        reason
                    );
                    if let Err(e) =
                        self.store
                            .record_transient_failure(entry, &reason, next_attempt_at)
                    {
                        log::error!("Could not record failure of entry {}: {}", entry.id, e);
                        self.release(entry);
                    }
                    FailureKind::Transient
                };

                result.record_failure(failure(entry, kind, reason));

                if !self.monitor.is_online() {
                    stop.store(true, Ordering::SeqCst);
                    result.aborted.get_or_insert(AbortReason::Offline);
                }
                ChainStep::Stop
            }
            DispatchOutcome::Permanent(reason) => {
                log::error!(
                    "{} for report {} rejected: {}",
                    entry.operation.as_str(),
                    entry.report_id,
                    reason
                );
                if let Err(e) = self.store.mark_terminal(entry, &reason) {
                    log::error!("Could not mark entry {} as failed: {}", entry.id, e);
                    self.release(entry);
                }
                result.record_failure(failure(entry, FailureKind::Permanent, reason));
                ChainStep::Stop
            }
            DispatchOutcome::Unauthorized => {
                log::warn!("Credentials rejected, stopping sync");
                self.release(entry);
                stop.store(true, Ordering::SeqCst);
                result.aborted.get_or_insert(AbortReason::Unauthorized);
                result.deferred += 1;
                ChainStep::Stop
            }
            DispatchOutcome::Integrity(reason) => {
                if let Err(e) = self.store.discard_entry(entry, &reason) {
                    log::error!("Could not discard entry {}: {}", entry.id, e);
                    self.release(entry);
                }
                result.record_failure(failure(entry, FailureKind::Integrity, reason));
                ChainStep::Continue
            }
        }
    }

    fn release(&self, entry: &SyncQueueEntry) {
        if let Err(e) = self.store.release_entry(&entry.id) {
            log::error!("Could not release entry {}: {}", entry.id, e);
        }
    }
}

fn failure(entry: &SyncQueueEntry, kind: FailureKind, reason: String) -> SyncFailure {
    SyncFailure {
        entry_id: entry.id.clone(),
        report_id: entry.report_id,
        operation: entry.operation,
        kind,
        reason,
    }
}

fn merge_chain(result: &mut SyncResult, joined: Result<SyncResult, JoinError>) {
    match joined {
        Ok(chain) => result.merge(chain),
        Err(e) => {
            log::error!("Report chain task failed: {}", e);
            result
                .aborted
                .get_or_insert(AbortReason::Interrupted(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientInfo, NewEntry, PhotoKind, Report, SyncStatus};
    use crate::services::connectivity::spawn_sync_trigger;
    use async_trait::async_trait;
    use mission_api::{RemoteReport, UploadedPhoto};
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    type Hook = Box<dyn Fn(&str) + Send + Sync>;

    /// In-memory backend with scripted failures
    #[derive(Default)]
    struct FakeRemote {
        reports: Mutex<HashMap<String, Value>>,
        photos: Mutex<Vec<String>>,
        calls: Mutex<Vec<String>>,
        failures: Mutex<HashMap<String, VecDeque<ApiError>>>,
        hook: Mutex<Option<Hook>>,
        gate: Mutex<Option<Arc<Notify>>>,
        latency: Mutex<Option<Duration>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeRemote {
        fn fail(&self, call: &str, error: ApiError) {
            lock(&self.failures)
                .entry(call.to_string())
                .or_default()
                .push_back(error);
        }

        fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }

        fn report(&self, id: Uuid) -> Option<Value> {
            lock(&self.reports).get(&id.to_string()).cloned()
        }

        fn enter(&self, call: String) -> Result<(), ApiError> {
            lock(&self.calls).push(call.clone());
            if let Some(hook) = lock(&self.hook).as_ref() {
                hook(&call);
            }
            match lock(&self.failures).get_mut(&call).and_then(|queue| queue.pop_front()) {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl RemoteApi for FakeRemote {
        async fn create_report(&self, id: &str, payload: &Value) -> Result<RemoteReport, ApiError> {
            let gate = lock(&self.gate).clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let latency = *lock(&self.latency);
            if let Some(latency) = latency {
                let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(latency).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
            }
            self.enter(format!("create:{}", id))?;
            lock(&self.reports).insert(id.to_string(), payload.clone());
            Ok(RemoteReport {
                id: id.to_string(),
                updated_at: Some(Utc::now()),
            })
        }

        async fn update_report(&self, id: &str, payload: &Value) -> Result<RemoteReport, ApiError> {
            self.enter(format!("update:{}", id))?;
            let mut reports = lock(&self.reports);
            match reports.get_mut(id) {
                Some(stored) => {
                    *stored = payload.clone();
                    Ok(RemoteReport {
                        id: id.to_string(),
                        updated_at: Some(Utc::now()),
                    })
                }
                None => Err(ApiError::from_status(404, String::new())),
            }
        }

        async fn delete_report(&self, id: &str) -> Result<(), ApiError> {
            self.enter(format!("delete:{}", id))?;
            match lock(&self.reports).remove(id) {
                Some(_) => Ok(()),
                None => Err(ApiError::from_status(404, String::new())),
            }
        }

        async fn upload_photo(&self, upload: &PhotoUpload) -> Result<UploadedPhoto, ApiError> {
            self.enter(format!("upload:{}", upload.photo_id))?;
            lock(&self.photos).push(upload.photo_id.clone());
            Ok(UploadedPhoto {
                url: format!("https://cdn.test/{}", upload.file_name()),
            })
        }

        async fn ping(&self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    struct Harness {
        store: LocalStore,
        remote: Arc<FakeRemote>,
        monitor: ConnectivityMonitor,
        manager: SyncManager,
    }

    fn harness_with(online: bool, config: SyncConfig) -> Harness {
        let store = LocalStore::open_in_memory().unwrap();
        let remote = Arc::new(FakeRemote::default());
        let monitor = ConnectivityMonitor::new(online);
        let manager = SyncManager::new(store.clone(), remote.clone(), monitor.clone(), &config);
        Harness {
            store,
            remote,
            monitor,
            manager,
        }
    }

    fn harness(online: bool) -> Harness {
        harness_with(online, SyncConfig::default())
    }

    fn draft(name: &str) -> Report {
        Report::new(ClientInfo {
            name: name.to_string(),
            address: "5 allée des Pins".to_string(),
            ..Default::default()
        })
    }

    fn unavailable() -> ApiError {
        ApiError::from_status(503, String::new())
    }

    #[tokio::test]
    async fn test_offline_draft_then_edit_syncs_as_single_create() {
        let h = harness(false);
        let mut report = draft("Mercier");
        h.store.put(&report).unwrap();
        report.client.address = "8 boulevard Sud".to_string();
        h.store.put(&report).unwrap();

        let pending = h.store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["client"]["address"], "8 boulevard Sud");

        let offline = h.manager.sync(SyncTrigger::Manual).await;
        assert_eq!(offline.aborted, Some(AbortReason::Offline));
        assert!(h.remote.calls().is_empty());

        h.monitor.set_online(true);
        let result = h.manager.sync(SyncTrigger::Connectivity).await;

        assert_eq!(result.state(), SyncState::Completed);
        assert_eq!(result.succeeded, 1);
        assert_eq!(h.remote.calls(), vec![format!("create:{}", report.id)]);
        assert_eq!(
            h.remote.report(report.id).unwrap()["client"]["address"],
            "8 boulevard Sud"
        );
        assert_eq!(h.store.pending_count().unwrap(), 0);
        let stored = h.store.get(report.id).unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(stored.remote_updated_at.is_some());
    }

    #[tokio::test]
    async fn test_fifo_replay_converges_to_local_state() {
        let h = harness(true);
        let mut report = draft("Fontaine");
        h.store.put(&report).unwrap();
        h.manager.sync(SyncTrigger::Manual).await;

        h.monitor.set_online(false);
        for (i, notes) in ["gutter", "gutter, chimney", "chimney only"].iter().enumerate() {
            report.roof.notes = Some(notes.to_string());
            report.roof.moss_level = Some(i as u8);
            h.store.put(&report).unwrap();
        }
        assert_eq!(h.store.list_pending().unwrap().len(), 3);

        h.monitor.set_online(true);
        let result = h.manager.sync(SyncTrigger::Connectivity).await;
        assert_eq!(result.succeeded, 3);

        let local = h.store.get(report.id).unwrap().unwrap();
        assert_eq!(
            h.remote.report(report.id).unwrap(),
            local.payload().to_json().unwrap()
        );
        assert_eq!(local.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_delete_after_unsynced_edits() {
        let h = harness(false);
        let mut report = draft("Renard");
        h.store.put(&report).unwrap();
        report.roof.surface_m2 = Some(120.0);
        h.store.put(&report).unwrap();
        h.store.delete(report.id).unwrap();

        let pending = h.store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, SyncOperation::Delete);

        h.monitor.set_online(true);
        let result = h.manager.sync(SyncTrigger::Manual).await;

        // Never created remotely: the 404 counts as done
        assert_eq!(result.succeeded, 1);
        assert!(result.deleted_reports.contains(&report.id));
        assert_eq!(h.remote.calls(), vec![format!("delete:{}", report.id)]);
        assert_eq!(h.store.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_share_one_cycle() {
        let h = harness(true);
        let report = draft("Simon");
        h.store.put(&report).unwrap();

        let gate = Arc::new(Notify::new());
        *lock(&h.remote.gate) = Some(gate.clone());

        let first = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.sync(SyncTrigger::Manual).await }
        });
        while !h.manager.is_syncing() {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.sync(SyncTrigger::Periodic).await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        gate.notify_one();
        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.trigger, SyncTrigger::Manual);
        assert_eq!(h.remote.calls().len(), 1);
        assert_eq!(h.manager.history().len(), 1);
        assert!(!h.manager.is_syncing());
    }

    #[tokio::test]
    async fn test_transient_failure_blocks_only_its_own_report() {
        let h = harness(true);
        let r = draft("Rousseau");
        let s = draft("Vincent");
        h.store.put(&r).unwrap();
        let photo = h.store.add_photo(r.id, PhotoKind::Before, vec![1, 2], None).unwrap();
        h.store.put(&s).unwrap();
        h.remote.fail(&format!("create:{}", r.id), unavailable());

        let result = h.manager.sync(SyncTrigger::Manual).await;

        assert_eq!(result.state(), SyncState::Completed);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.deferred, 1);
        assert_eq!(result.failures[0].kind, FailureKind::Transient);
        assert!(result.synced_reports.contains(&s.id));
        assert!(!h
            .remote
            .calls()
            .contains(&format!("upload:{}", photo.id)));

        let entries = h.store.entries_for_report(r.id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].attempt_count, 1);
        assert!(entries[0].next_attempt_at.is_some());
        assert_eq!(entries[1].attempt_count, 0);
        assert_eq!(
            h.store.get(s.id).unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_connection_lost_between_photo_uploads() {
        let h = harness(true);
        let report = draft("Lefebvre");
        h.store.put(&report).unwrap();
        h.manager.sync(SyncTrigger::Manual).await;

        h.monitor.set_online(false);
        let first = h.store.add_photo(report.id, PhotoKind::Before, vec![1], None).unwrap();
        let second = h.store.add_photo(report.id, PhotoKind::Before, vec![2], None).unwrap();

        let second_call = format!("upload:{}", second.id);
        h.remote.fail(&second_call, ApiError::Network("connection reset".to_string()));
        let monitor = h.monitor.clone();
        *lock(&h.remote.hook) = Some(Box::new(move |call: &str| {
            if call == second_call {
                monitor.set_online(false);
            }
        }));

        h.monitor.set_online(true);
        let result = h.manager.sync(SyncTrigger::Connectivity).await;

        assert_eq!(result.state(), SyncState::Failed);
        assert_eq!(result.aborted, Some(AbortReason::Offline));
        assert_eq!(result.succeeded, 1);
        let remaining = h.store.list_pending().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].attempt_count, 1);
        assert_eq!(remaining[0].payload["photo_id"], second.id.to_string());
        assert!(h.store.get_photo(first.id).unwrap().unwrap().is_uploaded());

        *lock(&h.remote.hook) = None;
        let before = h.remote.calls().len();
        h.monitor.set_online(true);
        let result = h.manager.sync(SyncTrigger::Connectivity).await;

        assert_eq!(result.state(), SyncState::Completed);
        assert_eq!(
            h.remote.calls()[before..],
            [format!("upload:{}", second.id)]
        );
        assert_eq!(h.store.pending_count().unwrap(), 0);
        assert_eq!(
            h.store.get(report.id).unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_needs_user_action() {
        let h = harness(true);
        let report = draft("Dubois");
        h.store.put(&report).unwrap();
        h.remote.fail(
            &format!("create:{}", report.id),
            ApiError::from_status(422, "roof_type invalid".to_string()),
        );

        let result = h.manager.sync(SyncTrigger::Manual).await;
        assert_eq!(result.failures[0].kind, FailureKind::Permanent);
        assert!(result.failures[0].reason.contains("422"));
        assert_eq!(
            h.store.get(report.id).unwrap().unwrap().sync_status,
            SyncStatus::Error
        );
        assert_eq!(h.manager.snapshot().failed_count, 1);

        // Not retried automatically
        let again = h.manager.sync(SyncTrigger::Manual).await;
        assert_eq!(again.succeeded + again.failed, 0);
        assert_eq!(h.remote.calls().len(), 1);

        let retried = h.manager.retry_report(report.id).await.unwrap();
        assert_eq!(retried.succeeded, 1);
        assert_eq!(
            h.store.get(report.id).unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_discard_failed_entries() {
        let h = harness(true);
        let report = draft("Morel");
        h.store.put(&report).unwrap();
        h.remote.fail(&format!("create:{}", report.id), ApiError::from_status(400, String::new()));
        h.manager.sync(SyncTrigger::Manual).await;

        assert_eq!(h.manager.discard_failed(report.id).unwrap(), 1);
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.failed_count, 0);
        assert_eq!(snapshot.pending_count, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_become_permanent_after_max_attempts() {
        let config = SyncConfig {
            max_attempts: 2,
            ..Default::default()
        };
        let h = harness_with(true, config);
        let report = draft("Fournier");
        h.store.put(&report).unwrap();
        let call = format!("create:{}", report.id);
        h.remote.fail(&call, unavailable());
        h.remote.fail(&call, unavailable());

        let first = h.manager.sync(SyncTrigger::Manual).await;
        assert_eq!(first.failures[0].kind, FailureKind::Transient);

        let second = h.manager.sync(SyncTrigger::Manual).await;
        assert_eq!(second.failures[0].kind, FailureKind::Permanent);

        let entries = h.store.list_terminal().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 2);
        assert!(entries[0].last_error.as_deref().unwrap().contains("gave up"));
    }

    #[tokio::test]
    async fn test_scheduled_triggers_respect_backoff() {
        let h = harness(true);
        let report = draft("Girard");
        h.store.put(&report).unwrap();
        h.remote.fail(&format!("create:{}", report.id), unavailable());
        h.manager.sync(SyncTrigger::Manual).await;

        let periodic = h.manager.sync(SyncTrigger::Periodic).await;
        assert_eq!(periodic.deferred, 1);
        assert_eq!(h.remote.calls().len(), 1);

        let manual = h.manager.sync(SyncTrigger::Manual).await;
        assert_eq!(manual.succeeded, 1);
        assert_eq!(h.remote.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_aborts_without_counting_attempt() {
        let h = harness(true);
        let report = draft("Andre");
        h.store.put(&report).unwrap();
        h.remote.fail(&format!("create:{}", report.id), ApiError::Unauthorized);

        let result = h.manager.sync(SyncTrigger::Manual).await;

        assert_eq!(result.aborted, Some(AbortReason::Unauthorized));
        assert_eq!(result.state(), SyncState::Failed);
        let pending = h.store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, EntryState::Pending);
        assert_eq!(pending[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_orphaned_entry_is_discarded() {
        let h = harness(true);
        let ghost = draft("Fantome");
        h.store.enqueue(NewEntry::update(&ghost).unwrap()).unwrap();

        let result = h.manager.sync(SyncTrigger::Manual).await;

        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].kind, FailureKind::Integrity);
        assert_eq!(result.state(), SyncState::Completed);
        assert_eq!(h.store.pending_count().unwrap(), 0);
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_cycle() {
        let remote = Arc::new(FakeRemote::default());
        let manager = SyncManager::new(
            LocalStore::new(),
            remote.clone(),
            ConnectivityMonitor::new(true),
            &SyncConfig::default(),
        );

        let result = manager.sync(SyncTrigger::Manual).await;
        assert!(matches!(result.aborted, Some(AbortReason::StoreUnavailable(_))));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions_until_disposed() {
        let h = harness(true);
        h.store.put(&draft("Robin")).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let mut subscription = h.manager.on_sync_status_change({
            let events = events.clone();
            move |event| {
                let label = match event {
                    SyncEvent::Status(state) => state.as_str().to_string(),
                    SyncEvent::Finished(result) => format!("finished:{}", result.succeeded),
                };
                lock(&events).push(label);
            }
        });

        h.manager.sync(SyncTrigger::Manual).await;
        assert_eq!(
            *lock(&events),
            vec!["syncing", "completed", "finished:1", "idle"]
        );

        subscription.dispose();
        subscription.dispose();
        assert!(!subscription.is_active());
        assert_eq!(h.manager.subscriber_count(), 0);

        h.manager.sync(SyncTrigger::Manual).await;
        assert_eq!(lock(&events).len(), 4);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let h = harness(true);
        {
            let _subscription = h.manager.on_sync_status_change(|_| {});
            assert_eq!(h.manager.subscriber_count(), 1);
        }
        assert_eq!(h.manager.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_and_history() {
        let h = harness(true);
        let report = draft("Garcia");
        h.store.put(&report).unwrap();
        h.manager.refresh_snapshot();

        let rx = h.manager.watch_snapshot();
        assert_eq!(rx.borrow().pending_count, 1);
        assert_eq!(rx.borrow().state, SyncState::Idle);

        h.manager.sync(SyncTrigger::Manual).await;

        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.state, SyncState::Idle);
        assert_eq!(snapshot.pending_count, 0);
        assert!(snapshot.online);
        assert_eq!(snapshot.last_result.unwrap().succeeded, 1);
        assert_eq!(h.manager.history().len(), 1);
        assert!(h.manager.next_sync_eta().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sync_and_eta() {
        let h = harness(true);
        h.store.put(&draft("Perrin")).unwrap();

        let handle = h.manager.spawn_periodic(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let eta = h.manager.next_sync_eta().unwrap();
        assert!(eta <= Duration::from_secs(29));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.manager.history().len(), 1);
        assert_eq!(h.manager.history()[0].trigger, SyncTrigger::Periodic);
        assert_eq!(h.store.pending_count().unwrap(), 0);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_trigger_waits_for_stable_connection() {
        let h = harness(false);
        h.store.put(&draft("Bonnet")).unwrap();
        let trigger = spawn_sync_trigger(&h.monitor, h.manager.clone(), Duration::from_millis(1500));
        tokio::task::yield_now().await;

        // Flapping within the quiet window does not sync
        h.monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.monitor.set_online(false);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(h.manager.history().is_empty());

        h.monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(h.manager.history().is_empty());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let history = h.manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].trigger, SyncTrigger::Connectivity);

        // Staying online does not trigger again
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.manager.history().len(), 1);

        trigger.abort();
    }

    #[tokio::test]
    async fn test_unsettled_entry_holds_back_its_report() {
        let h = harness(true);
        let report = draft("Chevalier");
        h.store.put(&report).unwrap();
        let photo = h.store.add_photo(report.id, PhotoKind::Before, vec![1, 2, 3], None).unwrap();
        let other = draft("Lambert");
        h.store.put(&other).unwrap();

        // A claimed create that was never settled (failed write, dead chain task)
        let create = h.store.list_pending().unwrap().remove(0);
        assert_eq!(create.operation, SyncOperation::Create);
        assert_eq!(create.report_id, report.id);
        h.store.mark_in_flight(&create.id).unwrap().unwrap();

        let result = h.manager.sync(SyncTrigger::Manual).await;

        assert_eq!(result.state(), SyncState::Completed);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.deferred, 1);
        assert_eq!(h.remote.calls(), vec![format!("create:{}", other.id)]);

        h.store.release_entry(&create.id).unwrap();
        let result = h.manager.sync(SyncTrigger::Manual).await;

        assert_eq!(result.succeeded, 2);
        assert_eq!(
            h.remote.calls()[1..],
            [
                format!("create:{}", report.id),
                format!("upload:{}", photo.id)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_request_times_out_as_transient() {
        let config = SyncConfig {
            request_timeout_secs: 5,
            ..Default::default()
        };
        let h = harness_with(true, config);
        let report = draft("Lemaire");
        h.store.put(&report).unwrap();
        *lock(&h.remote.latency) = Some(Duration::from_secs(60));

        let result = h.manager.sync(SyncTrigger::Manual).await;

        assert_eq!(result.state(), SyncState::Completed);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].kind, FailureKind::Transient);
        assert_eq!(result.failures[0].reason, ApiError::Timeout.to_string());
        assert!(h.remote.calls().is_empty());

        let pending = h.store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt_count, 1);
        assert_eq!(pending[0].state, EntryState::Pending);
        assert!(pending[0].next_attempt_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_chains_respect_concurrency_limit() {
        let config = SyncConfig {
            max_concurrent_reports: 2,
            ..Default::default()
        };
        let h = harness_with(true, config);
        for name in ["Bernard", "Thomas", "Petit", "Durand", "Moreau"] {
            h.store.put(&draft(name)).unwrap();
        }
        *lock(&h.remote.latency) = Some(Duration::from_secs(1));

        let result = h.manager.sync(SyncTrigger::Manual).await;

        assert_eq!(result.succeeded, 5);
        assert_eq!(h.remote.calls().len(), 5);
        assert_eq!(h.remote.peak.load(Ordering::SeqCst), 2);
        assert_eq!(h.remote.running.load(Ordering::SeqCst), 0);
    }
}
