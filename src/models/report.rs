use crate::error::AppError;
use crate::models::photo::{Photo, PhotoKind};
use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Column list matching `TryFrom<&Row> for Report`
pub(crate) const REPORT_COLUMNS: &str = "id, status, sync_status, client_name, client_address, \
     client_phone, client_email, roof_type, surface_m2, roof_condition, moss_level, notes, \
     worker_signature, worker_signed_at, client_signature, client_signed_at, \
     created_at, updated_at, completed_at, remote_updated_at";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Draft,
    PendingSignature,
    Completed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Draft => "draft",
            ReportStatus::PendingSignature => "pending_signature",
            ReportStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending_signature" => ReportStatus::PendingSignature,
            "completed" => ReportStatus::Completed,
            _ => ReportStatus::Draft,
        }
    }
}

/// Derived from queue membership and the last sync outcome, never set by the UI
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "synced" => SyncStatus::Synced,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    pub name: String,
    pub address: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoofAssessment {
    pub roof_type: Option<String>,
    pub surface_m2: Option<f64>,
    pub condition: Option<String>,
    pub moss_level: Option<u8>, // 0 (clean) ..= 5 (fully covered)
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signature {
    #[serde(with = "base64_image")]
    pub image: Vec<u8>, // PNG bytes
    pub signed_at: DateTime<Utc>,
}

impl Signature {
    pub fn now(image: Vec<u8>) -> Self {
        Self {
            image,
            signed_at: Utc::now(),
        }
    }
}

/// Mission report, the unit of sync
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub id: Uuid,
    pub status: ReportStatus,
    pub sync_status: SyncStatus,
    pub client: ClientInfo,
    pub roof: RoofAssessment,
    pub worker_signature: Option<Signature>,
    pub client_signature: Option<Signature>,
    #[serde(default)]
    pub photos: Vec<Photo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub remote_updated_at: Option<DateTime<Utc>>,
}

/// Snapshot sent to the server: the report without photos and local sync state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportPayload {
    pub id: Uuid,
    pub status: ReportStatus,
    pub client: ClientInfo,
    pub roof: RoofAssessment,
    pub worker_signature: Option<Signature>,
    pub client_signature: Option<Signature>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filter for `LocalStore::list`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportFilter {
    pub status: Option<ReportStatus>,
    pub sync_status: Option<SyncStatus>,
    pub client_name: Option<String>,
}

impl Report {
    /// Creates a new draft with a client-generated id
    pub fn new(client: ClientInfo) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: ReportStatus::Draft,
            sync_status: SyncStatus::Pending,
            client,
            roof: RoofAssessment::default(),
            worker_signature: None,
            client_signature: None,
            photos: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            remote_updated_at: None,
        }
    }

    pub fn sign_worker(&mut self, image: Vec<u8>) {
        self.worker_signature = Some(Signature::now(image));
        if self.status == ReportStatus::Draft {
            self.status = ReportStatus::PendingSignature;
        }
    }

    pub fn sign_client(&mut self, image: Vec<u8>) {
        self.client_signature = Some(Signature::now(image));
    }

    /// Validates all editable fields
    pub fn validate(&self) -> Result<(), AppError> {
        if self.client.name.trim().is_empty() {
            return Err(AppError::Validation(
                "Client name must not be empty".to_string(),
            ));
        }

        if self.client.name.len() > 200 {
            return Err(AppError::Validation(
                "Client name must be at most 200 characters".to_string(),
            ));
        }

        if let Some(surface) = self.roof.surface_m2 {
            if !surface.is_finite() || surface < 0.0 {
                return Err(AppError::Validation(
                    "Roof surface must be a positive number".to_string(),
                ));
            }
        }

        if let Some(level) = self.roof.moss_level {
            if level > 5 {
                return Err(AppError::Validation(
                    "Moss level must be between 0 and 5".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// A report may only be completed with both signatures and before/after photos
    pub fn check_completion(&self, photos: &[Photo]) -> Result<(), AppError> {
        if self.worker_signature.is_none() {
            return Err(AppError::Validation(
                "Worker signature is required to complete the report".to_string(),
            ));
        }
        if self.client_signature.is_none() {
            return Err(AppError::Validation(
                "Client signature is required to complete the report".to_string(),
            ));
        }
        if !photos.iter().any(|p| p.kind == PhotoKind::Before) {
            return Err(AppError::Validation(
                "At least one 'before' photo is required".to_string(),
            ));
        }
        if !photos.iter().any(|p| p.kind == PhotoKind::After) {
            return Err(AppError::Validation(
                "At least one 'after' photo is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn payload(&self) -> ReportPayload {
        ReportPayload {
            id: self.id,
            status: self.status,
            client: self.client.clone(),
            roof: self.roof.clone(),
            worker_signature: self.worker_signature.clone(),
            client_signature: self.client_signature.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }
}

impl ReportPayload {
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

fn signature_from_columns(
    image: Option<Vec<u8>>,
    signed_at: Option<DateTime<Utc>>,
) -> Option<Signature> {
    match (image, signed_at) {
        (Some(image), Some(signed_at)) => Some(Signature { image, signed_at }),
        _ => None,
    }
}

impl<'r> TryFrom<&Row<'r>> for Report {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'r>) -> Result<Self, Self::Error> {
        let id: String = row.get(0)?;
        let status: String = row.get(1)?;
        let sync_status: String = row.get(2)?;

        Ok(Report {
            id: crate::models::parse_uuid(0, &id)?,
            status: ReportStatus::from_str(&status),
            sync_status: SyncStatus::from_str(&sync_status),
            client: ClientInfo {
                name: row.get(3)?,
                address: row.get(4)?,
                phone: row.get(5)?,
                email: row.get(6)?,
            },
            roof: RoofAssessment {
                roof_type: row.get(7)?,
                surface_m2: row.get(8)?,
                condition: row.get(9)?,
                moss_level: row.get(10)?,
                notes: row.get(11)?,
            },
            worker_signature: signature_from_columns(row.get(12)?, row.get(13)?),
            client_signature: signature_from_columns(row.get(14)?, row.get(15)?),
            photos: Vec::new(),
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
            completed_at: row.get(18)?,
            remote_updated_at: row.get(19)?,
        })
    }
}

/// Signature images travel as base64 inside JSON payloads
mod base64_image {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientInfo {
        ClientInfo {
            name: "Dupont".to_string(),
            address: "12 rue des Lilas".to_string(),
            ..Default::default()
        }
    }

    fn photo(kind: PhotoKind) -> Photo {
        Photo {
            id: Uuid::new_v4(),
            report_id: Uuid::new_v4(),
            kind,
            order: 0,
            checksum: String::new(),
            content_type: "image/jpeg".to_string(),
            remote_url: None,
            has_local_blob: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_report_is_pending_draft() {
        let report = Report::new(client());
        assert_eq!(report.status, ReportStatus::Draft);
        assert_eq!(report.sync_status, SyncStatus::Pending);
        assert!(!report.id.is_nil());
    }

    #[test]
    fn test_validate_empty_client_name() {
        let mut report = Report::new(client());
        report.client.name = "  ".to_string();
        assert!(report.validate().is_err());
    }

    #[test]
    fn test_validate_moss_level() {
        let mut report = Report::new(client());
        report.roof.moss_level = Some(6);
        assert!(report.validate().is_err());
        report.roof.moss_level = Some(3);
        assert!(report.validate().is_ok());
    }

    #[test]
    fn test_completion_requires_signatures_and_photos() {
        let mut report = Report::new(client());
        let photos = vec![photo(PhotoKind::Before), photo(PhotoKind::After)];
        assert!(report.check_completion(&photos).is_err());

        report.sign_worker(vec![1, 2, 3]);
        assert_eq!(report.status, ReportStatus::PendingSignature);
        assert!(report.check_completion(&photos).is_err());

        report.sign_client(vec![4, 5, 6]);
        assert!(report.check_completion(&photos).is_ok());
        assert!(report.check_completion(&photos[..1]).is_err());
    }

    #[test]
    fn test_payload_encodes_signature_as_base64() {
        let mut report = Report::new(client());
        report.sign_worker(vec![0xde, 0xad, 0xbe, 0xef]);

        let json = report.payload().to_json().unwrap();
        assert_eq!(json["worker_signature"]["image"], "3q2+7w==");
        assert!(json.get("photos").is_none());
        assert!(json.get("sync_status").is_none());

        let back = ReportPayload::from_json(&json).unwrap();
        assert_eq!(back, report.payload());
    }

    #[test]
    fn test_status_conversion() {
        assert_eq!(
            ReportStatus::from_str("pending_signature"),
            ReportStatus::PendingSignature
        );
        assert_eq!(ReportStatus::from_str("bogus"), ReportStatus::Draft);
        assert_eq!(SyncStatus::from_str("error"), SyncStatus::Error);
        assert_eq!(SyncStatus::Synced.as_str(), "synced");
    }
}
