pub mod photo;
pub mod report;
pub mod sync_entry;
pub mod sync_result;

pub use photo::{Photo, PhotoKind};
pub use report::{
    ClientInfo, Report, ReportFilter, ReportPayload, ReportStatus, RoofAssessment, Signature,
    SyncStatus,
};
pub use sync_entry::{
    EntryState, NewEntry, PhotoUploadPayload, RemoteEffect, SyncOperation, SyncQueueEntry,
};
pub use sync_result::{
    AbortReason, FailureKind, SyncFailure, SyncResult, SyncSnapshot, SyncState, SyncTrigger,
};

use rusqlite::types::Type;

/// Maps a UUID parse failure into a rusqlite conversion error for row mapping
pub(crate) fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
