//! Queue rules applied inside the store's transactions.
//!
//! Every function takes the connection of an open transaction; callers commit.

use crate::error::AppError;
use crate::models::sync_entry::ENTRY_COLUMNS;
use crate::models::{EntryState, NewEntry, SyncOperation, SyncQueueEntry};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;
use uuid::Uuid;

/// Enqueues a mutation, applying the collapse rules:
///
/// * create/update for a report with a pending create rewrites that create
///   and drops any pending updates queued behind it
/// * delete drops every other entry for the report, then appends
/// * everything else is appended in FIFO order
pub fn enqueue(conn: &Connection, entry: NewEntry) -> Result<SyncQueueEntry, AppError> {
    match entry.operation {
        SyncOperation::Create | SyncOperation::Update => {
            if let Some(create) = pending_create(conn, entry.report_id)? {
                return collapse_into_create(conn, create, &entry);
            }
            append(conn, &entry)
        }
        SyncOperation::Delete => {
            let dropped = conn.execute(
                "DELETE FROM sync_queue WHERE report_id = ?1",
                [entry.report_id.to_string()],
            )?;
            if dropped > 0 {
                log::debug!(
                    "Delete for report {} superseded {} queued entries",
                    entry.report_id,
                    dropped
                );
            }
            append(conn, &entry)
        }
        SyncOperation::UploadPhoto => append(conn, &entry),
    }
}

fn pending_create(conn: &Connection, report_id: Uuid) -> Result<Option<SyncQueueEntry>, AppError> {
    let sql = format!(
        "SELECT {} FROM sync_queue
         WHERE report_id = ?1 AND operation = 'create' AND state = 'pending'
         ORDER BY seq LIMIT 1",
        ENTRY_COLUMNS
    );
    let entry = conn
        .query_row(&sql, [report_id.to_string()], |row| SyncQueueEntry::try_from(row))
        .optional()?;
    Ok(entry)
}

fn collapse_into_create(
    conn: &Connection,
    create: SyncQueueEntry,
    entry: &NewEntry,
) -> Result<SyncQueueEntry, AppError> {
    let payload = serde_json::to_string(&entry.payload)?;
    conn.execute(
        "UPDATE sync_queue SET payload = ?1 WHERE id = ?2",
        params![payload, create.id],
    )?;

    // Full snapshots: later pending updates are superseded by the rewritten create
    conn.execute(
        "DELETE FROM sync_queue
         WHERE report_id = ?1 AND operation = 'update' AND state = 'pending' AND seq > ?2",
        params![entry.report_id.to_string(), create.seq],
    )?;

    log::debug!(
        "Collapsed {} for report {} into create {}",
        entry.operation.as_str(),
        entry.report_id,
        create.id
    );

    get_entry(conn, &create.id)?.ok_or_else(|| {
        AppError::QueueIntegrity(format!("create entry {} vanished during collapse", create.id))
    })
}

fn append(conn: &Connection, entry: &NewEntry) -> Result<SyncQueueEntry, AppError> {
    let id = Ulid::new().to_string();
    let payload = serde_json::to_string(&entry.payload)?;

    conn.execute(
        "INSERT INTO sync_queue (id, report_id, operation, payload, state, attempt_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![
            id,
            entry.report_id.to_string(),
            entry.operation.as_str(),
            payload,
            EntryState::Pending.as_str(),
            Utc::now(),
        ],
    )?;

    get_entry(conn, &id)?
        .ok_or_else(|| AppError::QueueIntegrity(format!("entry {} not found after insert", id)))
}

pub fn get_entry(conn: &Connection, entry_id: &str) -> Result<Option<SyncQueueEntry>, AppError> {
    let sql = format!("SELECT {} FROM sync_queue WHERE id = ?1", ENTRY_COLUMNS);
    let entry = conn
        .query_row(&sql, [entry_id], |row| SyncQueueEntry::try_from(row))
        .optional()?;
    Ok(entry)
}

/// Entries in one state, FIFO order
pub fn list_by_state(conn: &Connection, state: EntryState) -> Result<Vec<SyncQueueEntry>, AppError> {
    let sql = format!(
        "SELECT {} FROM sync_queue WHERE state = ?1 ORDER BY seq",
        ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([state.as_str()], |row| SyncQueueEntry::try_from(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn list_for_report(conn: &Connection, report_id: Uuid) -> Result<Vec<SyncQueueEntry>, AppError> {
    let sql = format!(
        "SELECT {} FROM sync_queue WHERE report_id = ?1 ORDER BY seq",
        ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([report_id.to_string()], |row| SyncQueueEntry::try_from(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn count_by_state(conn: &Connection, states: &[EntryState]) -> Result<usize, AppError> {
    let mut total = 0usize;
    for state in states {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE state = ?1",
            [state.as_str()],
            |row| row.get(0),
        )?;
        total += count as usize;
    }
    Ok(total)
}

/// Claims a pending entry for dispatch. Returns false if it is gone or not pending.
pub fn mark_in_flight(conn: &Connection, entry_id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
    let changed = conn.execute(
        "UPDATE sync_queue SET state = 'in_flight', last_attempt_at = ?1
         WHERE id = ?2 AND state = 'pending'",
        params![now, entry_id],
    )?;
    Ok(changed == 1)
}

/// Counts a failed attempt and schedules the next one; returns the new attempt count
pub fn record_transient_failure(
    conn: &Connection,
    entry_id: &str,
    error: &str,
    next_attempt_at: DateTime<Utc>,
) -> Result<Option<u32>, AppError> {
    conn.execute(
        "UPDATE sync_queue
         SET state = 'pending', attempt_count = attempt_count + 1,
             last_error = ?1, next_attempt_at = ?2
         WHERE id = ?3",
        params![error, next_attempt_at, entry_id],
    )?;
    let attempts = conn
        .query_row(
            "SELECT attempt_count FROM sync_queue WHERE id = ?1",
            [entry_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(attempts)
}

/// Takes the entry out of the retry rotation until the user acts on it
pub fn mark_terminal(conn: &Connection, entry_id: &str, error: &str) -> Result<bool, AppError> {
    let changed = conn.execute(
        "UPDATE sync_queue
         SET state = 'terminal', attempt_count = attempt_count + 1,
             last_error = ?1, next_attempt_at = NULL
         WHERE id = ?2",
        params![error, entry_id],
    )?;
    Ok(changed == 1)
}

/// Returns an in-flight entry to pending without counting an attempt
pub fn release(conn: &Connection, entry_id: &str) -> Result<bool, AppError> {
    let changed = conn.execute(
        "UPDATE sync_queue SET state = 'pending' WHERE id = ?1 AND state = 'in_flight'",
        [entry_id],
    )?;
    Ok(changed == 1)
}

pub fn remove(conn: &Connection, entry_id: &str) -> Result<bool, AppError> {
    let changed = conn.execute("DELETE FROM sync_queue WHERE id = ?1", [entry_id])?;
    Ok(changed == 1)
}

/// Terminal entries of a report back into rotation with a fresh attempt budget
pub fn retry_terminal(conn: &Connection, report_id: Uuid) -> Result<usize, AppError> {
    let changed = conn.execute(
        "UPDATE sync_queue
         SET state = 'pending', attempt_count = 0, next_attempt_at = NULL, last_error = NULL
         WHERE report_id = ?1 AND state = 'terminal'",
        [report_id.to_string()],
    )?;
    Ok(changed)
}

pub fn discard_terminal(conn: &Connection, report_id: Uuid) -> Result<usize, AppError> {
    let changed = conn.execute(
        "DELETE FROM sync_queue WHERE report_id = ?1 AND state = 'terminal'",
        [report_id.to_string()],
    )?;
    Ok(changed)
}

/// Derives the report's sync_status from its queue entries
pub fn refresh_sync_status(conn: &Connection, report_id: Uuid) -> Result<(), AppError> {
    conn.execute(
        "UPDATE reports SET sync_status = CASE
             WHEN EXISTS (SELECT 1 FROM sync_queue WHERE report_id = ?1 AND state = 'terminal') THEN 'error'
             WHEN EXISTS (SELECT 1 FROM sync_queue WHERE report_id = ?1) THEN 'pending'
             ELSE 'synced'
         END
         WHERE id = ?1",
        [report_id.to_string()],
    )?;
    Ok(())
}
