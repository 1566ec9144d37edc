use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical report fields returned by the server after create/update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteReport {
    pub id: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Response of a photo upload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadedPhoto {
    pub url: String,
}

/// A photo upload request (sent as multipart form)
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoUpload {
    pub report_id: String,
    pub photo_id: String,
    pub kind: String, // "before" | "after"
    pub order: u32,
    pub checksum: String, // sha-256 hex of `data`
    pub content_type: String,
    pub data: Vec<u8>,
}

impl PhotoUpload {
    /// File name used for the multipart part
    pub fn file_name(&self) -> String {
        let ext = match self.content_type.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            _ => "jpg",
        };
        format!("{}.{}", self.photo_id, ext)
    }
}
