//! Durable local store for reports, photos and the sync queue.
//!
//! Every write that changes a report also writes its queue entry in the same
//! transaction. Until the store is open, reads return empty results and writes
//! fail with [`AppError::StoreUnavailable`].

use crate::database;
use crate::error::AppError;
use crate::models::photo::{checksum, sniff_content_type, PHOTO_COLUMNS};
use crate::models::report::REPORT_COLUMNS;
use crate::models::{
    EntryState, NewEntry, Photo, PhotoKind, RemoteEffect, Report, ReportFilter, ReportStatus,
    SyncQueueEntry,
};
use crate::services::sync_queue;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

enum StoreState {
    Initializing,
    Ready(Connection),
    Unavailable(String),
}

/// Public view of the store lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Initializing,
    Ready,
    Unavailable(String),
}

/// Cheaply cloneable handle to the local database
#[derive(Clone)]
pub struct LocalStore {
    state: Arc<Mutex<StoreState>>,
    init_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    /// A store that is not open yet
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::Initializing)),
            init_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Ready store backed by an in-memory database
    pub fn open_in_memory() -> Result<Self, AppError> {
        let store = Self::new();
        *store.lock() = StoreState::Ready(database::open_in_memory()?);
        Ok(store)
    }

    /// Opens the database file off the async thread, bounded by `timeout`.
    ///
    /// Never fails: an open error or timeout leaves the store `Unavailable`
    /// and offline features disabled. Calling it again once ready is a no-op.
    pub async fn init(&self, path: impl Into<PathBuf>, timeout: Duration) -> Availability {
        let _guard = self.init_lock.lock().await;
        if self.is_ready() {
            return Availability::Ready;
        }
        *self.lock() = StoreState::Initializing;

        let path = path.into();
        let display = path.display().to_string();
        let opened = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || database::open_database(&path)),
        )
        .await;

        let state = match opened {
            Ok(Ok(Ok(conn))) => StoreState::Ready(conn),
            Ok(Ok(Err(e))) => {
                log::error!("Failed to open local store {}: {}", display, e);
                StoreState::Unavailable(e.to_string())
            }
            Ok(Err(e)) => {
                log::error!("Local store open task failed: {}", e);
                StoreState::Unavailable(e.to_string())
            }
            Err(_) => {
                log::error!("Opening local store {} timed out after {:?}", display, timeout);
                StoreState::Unavailable(format!("open timed out after {:?}", timeout))
            }
        };

        *self.lock() = state;
        self.availability()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.lock(), StoreState::Ready(_))
    }

    pub fn availability(&self) -> Availability {
        match &*self.lock() {
            StoreState::Initializing => Availability::Initializing,
            StoreState::Ready(_) => Availability::Ready,
            StoreState::Unavailable(reason) => Availability::Unavailable(reason.clone()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs a write against the open connection
    fn write<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut state = self.lock();
        match &mut *state {
            StoreState::Ready(conn) => f(conn),
            StoreState::Initializing => Err(AppError::StoreUnavailable(
                "store is still initializing".to_string(),
            )),
            StoreState::Unavailable(reason) => Err(AppError::StoreUnavailable(reason.clone())),
        }
    }

    /// Runs a read, yielding the empty value while the store is not ready
    fn read<T: Default>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let state = self.lock();
        match &*state {
            StoreState::Ready(conn) => f(conn),
            _ => Ok(T::default()),
        }
    }

    // ---- Reports ----

    /// Upserts a report and enqueues its create/update in one transaction.
    ///
    /// Photos on the passed report are ignored; they are managed via `add_photo`.
    pub fn put(&self, report: &Report) -> Result<Report, AppError> {
        report.validate()?;

        self.write(|conn| {
            let tx = conn.transaction()?;
            let existing = load_report(&tx, report.id)?;
            let photos = load_photos(&tx, report.id)?;

            let now = Utc::now();
            let mut stored = report.clone();
            if stored.status == ReportStatus::Completed {
                stored.check_completion(&photos)?;
                stored.completed_at = stored.completed_at.or(Some(now));
            } else {
                stored.completed_at = None;
            }
            if let Some(existing) = &existing {
                stored.created_at = existing.created_at;
                stored.remote_updated_at = existing.remote_updated_at;
            }
            stored.updated_at = now;

            upsert_report(&tx, &stored)?;

            let entry = if existing.is_some() {
                NewEntry::update(&stored)?
            } else {
                NewEntry::create(&stored)?
            };
            sync_queue::enqueue(&tx, entry)?;
            sync_queue::refresh_sync_status(&tx, stored.id)?;

            let mut saved = load_report(&tx, stored.id)?
                .ok_or_else(|| AppError::NotFound(format!("Report {}", stored.id)))?;
            saved.photos = photos;
            tx.commit()?;

            log::debug!("Saved report {} ({})", saved.id, saved.status.as_str());
            Ok(saved)
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Report>, AppError> {
        self.read(|conn| {
            let Some(mut report) = load_report(conn, id)? else {
                return Ok(None);
            };
            report.photos = load_photos(conn, id)?;
            Ok(Some(report))
        })
    }

    pub fn exists(&self, id: Uuid) -> Result<bool, AppError> {
        self.read(|conn| {
            let found: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM reports WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )?;
            Ok(found)
        })
    }

    /// Reports matching the filter, most recently updated first
    pub fn list(&self, filter: &ReportFilter) -> Result<Vec<Report>, AppError> {
        self.read(|conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<String> = Vec::new();

            if let Some(status) = filter.status {
                values.push(status.as_str().to_string());
                clauses.push(format!("status = ?{}", values.len()));
            }
            if let Some(sync_status) = filter.sync_status {
                values.push(sync_status.as_str().to_string());
                clauses.push(format!("sync_status = ?{}", values.len()));
            }
            if let Some(name) = filter.client_name.as_deref().filter(|n| !n.trim().is_empty()) {
                values.push(name.trim().to_lowercase());
                clauses.push(format!(
                    "instr(lower(client_name), ?{}) > 0",
                    values.len()
                ));
            }

            let mut sql = format!("SELECT {} FROM reports", REPORT_COLUMNS);
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY updated_at DESC");

            let mut stmt = conn.prepare(&sql)?;
            let mut reports = stmt
                .query_map(params_from_iter(values.iter()), |row| Report::try_from(row))?
                .collect::<Result<Vec<_>, _>>()?;

            for report in &mut reports {
                report.photos = load_photos(conn, report.id)?;
            }
            Ok(reports)
        })
    }

    /// Removes the report and its photos and enqueues the remote delete
    pub fn delete(&self, id: Uuid) -> Result<(), AppError> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM reports WHERE id = ?1", [id.to_string()])?;
            if removed == 0 {
                return Err(AppError::NotFound(format!("Report {}", id)));
            }
            sync_queue::enqueue(&tx, NewEntry::delete(id))?;
            tx.commit()?;

            log::info!("Deleted report {} locally", id);
            Ok(())
        })
    }

    // ---- Photos ----

    /// Stores a photo blob and enqueues its upload.
    ///
    /// Without an explicit `order` the next free slot for (report, kind) is used.
    pub fn add_photo(
        &self,
        report_id: Uuid,
        kind: PhotoKind,
        data: Vec<u8>,
        order: Option<u32>,
    ) -> Result<Photo, AppError> {
        if data.is_empty() {
            return Err(AppError::Validation("Photo must not be empty".to_string()));
        }

        self.write(|conn| {
            let tx = conn.transaction()?;
            if load_report(&tx, report_id)?.is_none() {
                return Err(AppError::NotFound(format!("Report {}", report_id)));
            }

            let order = match order {
                Some(order) => {
                    let taken: bool = tx.query_row(
                        "SELECT COUNT(*) > 0 FROM photos
                         WHERE report_id = ?1 AND kind = ?2 AND display_order = ?3",
                        params![report_id.to_string(), kind.as_str(), order],
                        |row| row.get(0),
                    )?;
                    if taken {
                        return Err(AppError::Validation(format!(
                            "A {} photo with order {} already exists",
                            kind.as_str(),
                            order
                        )));
                    }
                    order
                }
                None => tx.query_row(
                    "SELECT COALESCE(MAX(display_order) + 1, 0) FROM photos
                     WHERE report_id = ?1 AND kind = ?2",
                    params![report_id.to_string(), kind.as_str()],
                    |row| row.get(0),
                )?,
            };

            let photo = Photo {
                id: Uuid::new_v4(),
                report_id,
                kind,
                order,
                checksum: checksum(&data),
                content_type: sniff_content_type(&data).to_string(),
                remote_url: None,
                has_local_blob: true,
                created_at: Utc::now(),
            };

            tx.execute(
                "INSERT INTO photos (id, report_id, kind, display_order, checksum, content_type, blob, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    photo.id.to_string(),
                    report_id.to_string(),
                    kind.as_str(),
                    order,
                    photo.checksum,
                    photo.content_type,
                    data,
                    photo.created_at,
                ],
            )?;

            sync_queue::enqueue(&tx, NewEntry::upload_photo(report_id, photo.id)?)?;
            sync_queue::refresh_sync_status(&tx, report_id)?;
            tx.commit()?;

            log::debug!(
                "Added {} photo {} (order {}) to report {}",
                kind.as_str(),
                photo.id,
                order,
                report_id
            );
            Ok(photo)
        })
    }

    pub fn get_photo(&self, photo_id: Uuid) -> Result<Option<Photo>, AppError> {
        self.read(|conn| {
            let sql = format!("SELECT {} FROM photos WHERE id = ?1", PHOTO_COLUMNS);
            let photo = conn
                .query_row(&sql, [photo_id.to_string()], |row| Photo::try_from(row))
                .optional()?;
            Ok(photo)
        })
    }

    /// Local blob of a photo that has not been uploaded yet
    pub fn photo_blob(&self, photo_id: Uuid) -> Result<Option<Vec<u8>>, AppError> {
        self.read(|conn| {
            let blob: Option<Option<Vec<u8>>> = conn
                .query_row(
                    "SELECT blob FROM photos WHERE id = ?1",
                    [photo_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(blob.flatten())
        })
    }

    // ---- Queue ----

    pub fn enqueue(&self, entry: NewEntry) -> Result<SyncQueueEntry, AppError> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let report_id = entry.report_id;
            let stored = sync_queue::enqueue(&tx, entry)?;
            sync_queue::refresh_sync_status(&tx, report_id)?;
            tx.commit()?;
            Ok(stored)
        })
    }

    /// Entries waiting for dispatch, FIFO order
    pub fn list_pending(&self) -> Result<Vec<SyncQueueEntry>, AppError> {
        self.read(|conn| sync_queue::list_by_state(conn, EntryState::Pending))
    }

    /// Permanently failed entries awaiting user action
    pub fn list_terminal(&self) -> Result<Vec<SyncQueueEntry>, AppError> {
        self.read(|conn| sync_queue::list_by_state(conn, EntryState::Terminal))
    }

    /// Entries claimed by a drain that never settled them
    pub fn list_in_flight(&self) -> Result<Vec<SyncQueueEntry>, AppError> {
        self.read(|conn| sync_queue::list_by_state(conn, EntryState::InFlight))
    }

    pub fn entries_for_report(&self, report_id: Uuid) -> Result<Vec<SyncQueueEntry>, AppError> {
        self.read(|conn| sync_queue::list_for_report(conn, report_id))
    }

    /// Entries not yet synced (pending or in flight)
    pub fn pending_count(&self) -> Result<usize, AppError> {
        self.read(|conn| {
            sync_queue::count_by_state(conn, &[EntryState::Pending, EntryState::InFlight])
        })
    }

    pub fn failed_count(&self) -> Result<usize, AppError> {
        self.read(|conn| sync_queue::count_by_state(conn, &[EntryState::Terminal]))
    }

    pub fn remove_from_queue(&self, entry_id: &str) -> Result<bool, AppError> {
        self.write(|conn| remove_entry(conn, entry_id))
    }

    // ---- Drain bookkeeping ----

    /// Claims a pending entry for dispatch and returns its current payload.
    /// `None` when the entry was superseded or removed since it was listed.
    pub fn mark_in_flight(&self, entry_id: &str) -> Result<Option<SyncQueueEntry>, AppError> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            if !sync_queue::mark_in_flight(&tx, entry_id, Utc::now())? {
                return Ok(None);
            }
            let entry = sync_queue::get_entry(&tx, entry_id)?;
            tx.commit()?;
            Ok(entry)
        })
    }

    /// Removes a dispatched entry and writes the server's answer back
    pub fn complete_entry(
        &self,
        entry: &SyncQueueEntry,
        effect: &RemoteEffect,
    ) -> Result<(), AppError> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            sync_queue::remove(&tx, &entry.id)?;

            match effect {
                RemoteEffect::ReportSaved { remote_updated_at } => {
                    tx.execute(
                        "UPDATE reports SET remote_updated_at = COALESCE(?1, remote_updated_at) WHERE id = ?2",
                        params![remote_updated_at, entry.report_id.to_string()],
                    )?;
                }
                RemoteEffect::PhotoUploaded { photo_id, url } => {
                    // The remote copy is authoritative now, drop the local blob
                    tx.execute(
                        "UPDATE photos SET remote_url = ?1, blob = NULL WHERE id = ?2",
                        params![url, photo_id.to_string()],
                    )?;
                }
                RemoteEffect::ReportDeleted => {}
            }

            sync_queue::refresh_sync_status(&tx, entry.report_id)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Returns the attempt count after this failure, `None` if the entry is gone
    pub fn record_transient_failure(
        &self,
        entry: &SyncQueueEntry,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<Option<u32>, AppError> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let attempts =
                sync_queue::record_transient_failure(&tx, &entry.id, error, next_attempt_at)?;
            sync_queue::refresh_sync_status(&tx, entry.report_id)?;
            tx.commit()?;
            Ok(attempts)
        })
    }

    pub fn mark_terminal(&self, entry: &SyncQueueEntry, error: &str) -> Result<(), AppError> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            sync_queue::mark_terminal(&tx, &entry.id, error)?;
            sync_queue::refresh_sync_status(&tx, entry.report_id)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn release_entry(&self, entry_id: &str) -> Result<bool, AppError> {
        self.write(|conn| sync_queue::release(conn, entry_id))
    }

    /// Drops an entry that can never succeed
    pub fn discard_entry(&self, entry: &SyncQueueEntry, reason: &str) -> Result<(), AppError> {
        log::error!(
            "Discarding {} entry {} for report {}: {}",
            entry.operation.as_str(),
            entry.id,
            entry.report_id,
            reason
        );
        self.write(|conn| remove_entry(conn, &entry.id).map(|_| ()))
    }

    // ---- User recovery ----

    /// Puts the report's failed entries back into rotation
    pub fn retry_report(&self, report_id: Uuid) -> Result<usize, AppError> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let count = sync_queue::retry_terminal(&tx, report_id)?;
            sync_queue::refresh_sync_status(&tx, report_id)?;
            tx.commit()?;
            Ok(count)
        })
    }

    /// Gives up on the report's failed entries
    pub fn discard_failed(&self, report_id: Uuid) -> Result<usize, AppError> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let count = sync_queue::discard_terminal(&tx, report_id)?;
            sync_queue::refresh_sync_status(&tx, report_id)?;
            tx.commit()?;
            if count > 0 {
                log::warn!("Discarded {} failed entries for report {}", count, report_id);
            }
            Ok(count)
        })
    }
}

fn remove_entry(conn: &mut Connection, entry_id: &str) -> Result<bool, AppError> {
    let tx = conn.transaction()?;
    let Some(entry) = sync_queue::get_entry(&tx, entry_id)? else {
        return Ok(false);
    };
    sync_queue::remove(&tx, entry_id)?;
    sync_queue::refresh_sync_status(&tx, entry.report_id)?;
    tx.commit()?;
    Ok(true)
}

fn load_report(conn: &Connection, id: Uuid) -> Result<Option<Report>, AppError> {
    let sql = format!("SELECT {} FROM reports WHERE id = ?1", REPORT_COLUMNS);
    let report = conn
        .query_row(&sql, [id.to_string()], |row| Report::try_from(row))
        .optional()?;
    Ok(report)
}

fn load_photos(conn: &Connection, report_id: Uuid) -> Result<Vec<Photo>, AppError> {
    let sql = format!(
        "SELECT {} FROM photos WHERE report_id = ?1 ORDER BY kind DESC, display_order",
        PHOTO_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let photos = stmt
        .query_map([report_id.to_string()], |row| Photo::try_from(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(photos)
}

fn upsert_report(conn: &Connection, report: &Report) -> Result<(), AppError> {
    let (worker_image, worker_signed_at) = match &report.worker_signature {
        Some(sig) => (Some(sig.image.as_slice()), Some(sig.signed_at)),
        None => (None, None),
    };
    let (client_image, client_signed_at) = match &report.client_signature {
        Some(sig) => (Some(sig.image.as_slice()), Some(sig.signed_at)),
        None => (None, None),
    };

    conn.execute(
        "INSERT INTO reports (
            id, status, sync_status, client_name, client_address, client_phone, client_email,
            roof_type, surface_m2, roof_condition, moss_level, notes,
            worker_signature, worker_signed_at, client_signature, client_signed_at,
            created_at, updated_at, completed_at, remote_updated_at
         ) VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            client_name = excluded.client_name,
            client_address = excluded.client_address,
            client_phone = excluded.client_phone,
            client_email = excluded.client_email,
            roof_type = excluded.roof_type,
            surface_m2 = excluded.surface_m2,
            roof_condition = excluded.roof_condition,
            moss_level = excluded.moss_level,
            notes = excluded.notes,
            worker_signature = excluded.worker_signature,
            worker_signed_at = excluded.worker_signed_at,
            client_signature = excluded.client_signature,
            client_signed_at = excluded.client_signed_at,
            updated_at = excluded.updated_at,
            completed_at = excluded.completed_at",
        params![
            report.id.to_string(),
            report.status.as_str(),
            report.client.name,
            report.client.address,
            report.client.phone,
            report.client.email,
            report.roof.roof_type,
            report.roof.surface_m2,
            report.roof.condition,
            report.roof.moss_level,
            report.roof.notes,
            worker_image,
            worker_signed_at,
            client_image,
            client_signed_at,
            report.created_at,
            report.updated_at,
            report.completed_at,
            report.remote_updated_at,
        ],
    )?;
    Ok(())
}
