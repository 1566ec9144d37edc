use crate::models::report::Report;
use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub(crate) const ENTRY_COLUMNS: &str = "id, seq, report_id, operation, payload, state, \
     attempt_count, last_attempt_at, next_attempt_at, last_error, created_at";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
    UploadPhoto,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
            SyncOperation::UploadPhoto => "upload_photo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(SyncOperation::Create),
            "update" => Some(SyncOperation::Update),
            "delete" => Some(SyncOperation::Delete),
            "upload_photo" => Some(SyncOperation::UploadPhoto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting for the next drain cycle
    Pending,
    /// Dispatched in the running drain cycle
    InFlight,
    /// Permanently failed, waits for retry or discard by the user
    Terminal,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::InFlight => "in_flight",
            EntryState::Terminal => "terminal",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "in_flight" => EntryState::InFlight,
            "terminal" => EntryState::Terminal,
            _ => EntryState::Pending,
        }
    }
}

/// One pending mutation against one report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncQueueEntry {
    pub id: String, // ULID
    pub seq: i64,   // FIFO position
    pub report_id: Uuid,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
    pub state: EntryState,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SyncQueueEntry {
    /// Whether the backoff deadline (if any) has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Payload of an `upload_photo` entry; the blob itself stays in the photos table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhotoUploadPayload {
    pub photo_id: Uuid,
}

/// What the server did for a dispatched entry, written back into the store
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEffect {
    ReportSaved {
        remote_updated_at: Option<DateTime<Utc>>,
    },
    ReportDeleted,
    PhotoUploaded {
        photo_id: Uuid,
        url: String,
    },
}

/// An entry about to be enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub report_id: Uuid,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
}

impl NewEntry {
    pub fn create(report: &Report) -> Result<Self, serde_json::Error> {
        Ok(Self {
            report_id: report.id,
            operation: SyncOperation::Create,
            payload: report.payload().to_json()?,
        })
    }

    pub fn update(report: &Report) -> Result<Self, serde_json::Error> {
        Ok(Self {
            report_id: report.id,
            operation: SyncOperation::Update,
            payload: report.payload().to_json()?,
        })
    }

    pub fn delete(report_id: Uuid) -> Self {
        Self {
            report_id,
            operation: SyncOperation::Delete,
            payload: serde_json::Value::Null,
        }
    }

    pub fn upload_photo(report_id: Uuid, photo_id: Uuid) -> Result<Self, serde_json::Error> {
        Ok(Self {
            report_id,
            operation: SyncOperation::UploadPhoto,
            payload: serde_json::to_value(PhotoUploadPayload { photo_id })?,
        })
    }
}

impl<'r> TryFrom<&Row<'r>> for SyncQueueEntry {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'r>) -> Result<Self, Self::Error> {
        use rusqlite::types::Type;

        let report_id: String = row.get(2)?;
        let operation: String = row.get(3)?;
        let payload: String = row.get(4)?;
        let state: String = row.get(5)?;

        let operation = SyncOperation::parse(&operation).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Text,
                format!("unknown operation '{}'", operation).into(),
            )
        })?;
        let payload = serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

        Ok(SyncQueueEntry {
            id: row.get(0)?,
            seq: row.get(1)?,
            report_id: crate::models::parse_uuid(2, &report_id)?,
            operation,
            payload,
            state: EntryState::from_str(&state),
            attempt_count: row.get(6)?,
            last_attempt_at: row.get(7)?,
            next_attempt_at: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
        })
    }
}
