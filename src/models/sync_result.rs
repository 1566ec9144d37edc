use crate::models::sync_entry::SyncOperation;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// States of the sync manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Completed,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Completed => "completed",
            SyncState::Failed => "failed",
        }
    }
}

/// What started a drain cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Manual,
    Connectivity,
    Periodic,
    /// External background execution (service-worker style)
    Background,
}

impl SyncTrigger {
    /// Scheduled triggers wait for backoff deadlines; user and connectivity triggers don't
    pub fn respects_backoff(&self) -> bool {
        matches!(self, SyncTrigger::Periodic | SyncTrigger::Background)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Network or 5xx, entry stays queued with backoff
    Transient,
    /// Validation/conflict or retries exhausted, entry marked terminal
    Permanent,
    /// Entry violated a queue invariant and was discarded
    Integrity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncFailure {
    pub entry_id: String,
    pub report_id: Uuid,
    pub operation: SyncOperation,
    pub kind: FailureKind,
    pub reason: String,
}

/// Why a whole cycle was aborted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    Offline,
    Unauthorized,
    StoreUnavailable(String),
    /// The drain task itself died
    Interrupted(String),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Offline => write!(f, "connection lost"),
            AbortReason::Unauthorized => write!(f, "credentials rejected"),
            AbortReason::StoreUnavailable(msg) => write!(f, "local store unavailable: {}", msg),
            AbortReason::Interrupted(msg) => write!(f, "sync interrupted: {}", msg),
        }
    }
}

/// Summary of one drain cycle, kept in memory only
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub trigger: SyncTrigger,
    pub aborted: Option<AbortReason>,
    pub succeeded: usize,
    pub failed: usize,
    /// Entries left untouched (backoff not elapsed, blocked by a predecessor)
    pub deferred: usize,
    pub failures: Vec<SyncFailure>,
    pub synced_reports: BTreeSet<Uuid>,
    pub photo_reports: BTreeSet<Uuid>,
    pub deleted_reports: BTreeSet<Uuid>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    pub fn new(trigger: SyncTrigger) -> Self {
        let now = Utc::now();
        Self {
            trigger,
            aborted: None,
            succeeded: 0,
            failed: 0,
            deferred: 0,
            failures: Vec::new(),
            synced_reports: BTreeSet::new(),
            photo_reports: BTreeSet::new(),
            deleted_reports: BTreeSet::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn aborted(trigger: SyncTrigger, reason: AbortReason) -> Self {
        let mut result = Self::new(trigger);
        result.aborted = Some(reason);
        result
    }

    /// Terminal state the manager reports for this result
    pub fn state(&self) -> SyncState {
        if self.aborted.is_some() {
            SyncState::Failed
        } else {
            SyncState::Completed
        }
    }

    /// Reports whose remote state changed during the cycle
    pub fn changed_reports(&self) -> BTreeSet<Uuid> {
        self.synced_reports
            .iter()
            .chain(self.photo_reports.iter())
            .chain(self.deleted_reports.iter())
            .copied()
            .collect()
    }

    pub fn failures_for(&self, report_id: Uuid) -> impl Iterator<Item = &SyncFailure> {
        self.failures
            .iter()
            .filter(move |failure| failure.report_id == report_id)
    }

    pub(crate) fn record_failure(&mut self, failure: SyncFailure) {
        self.failed += 1;
        self.failures.push(failure);
    }

    /// Folds the outcome of one report chain into the cycle result
    pub(crate) fn merge(&mut self, other: SyncResult) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.failures.extend(other.failures);
        self.synced_reports.extend(other.synced_reports);
        self.photo_reports.extend(other.photo_reports);
        self.deleted_reports.extend(other.deleted_reports);
        if self.aborted.is_none() {
            self.aborted = other.aborted;
        }
    }
}

/// UI-facing status surface
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub state: SyncState,
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_result: Option<Arc<SyncResult>>,
    pub online: bool,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            pending_count: 0,
            failed_count: 0,
            last_result: None,
            online: false,
        }
    }
}
