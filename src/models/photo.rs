use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub(crate) const PHOTO_COLUMNS: &str =
    "id, report_id, kind, display_order, checksum, content_type, remote_url, blob IS NOT NULL, created_at";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PhotoKind {
    Before,
    After,
}

impl PhotoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoKind::Before => "before",
            PhotoKind::After => "after",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "after" => PhotoKind::After,
            _ => PhotoKind::Before,
        }
    }
}

/// Photo attached to exactly one report
///
/// Holds a local blob until the upload succeeds, then only the remote URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Photo {
    pub id: Uuid,
    pub report_id: Uuid,
    pub kind: PhotoKind,
    pub order: u32, // unique per (report, kind)
    pub checksum: String,
    pub content_type: String,
    pub remote_url: Option<String>,
    pub has_local_blob: bool,
    pub created_at: DateTime<Utc>,
}

impl Photo {
    pub fn is_uploaded(&self) -> bool {
        self.remote_url.is_some()
    }
}

/// SHA-256 hex digest of a photo blob
pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Detects the image type from magic bytes, JPEG when unknown
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

impl<'r> TryFrom<&Row<'r>> for Photo {
    type Error = rusqlite::Error;

    fn try_from(row: &Row<'r>) -> Result<Self, Self::Error> {
        let id: String = row.get(0)?;
        let report_id: String = row.get(1)?;
        let kind: String = row.get(2)?;

        Ok(Photo {
            id: crate::models::parse_uuid(0, &id)?,
            report_id: crate::models::parse_uuid(1, &report_id)?,
            kind: PhotoKind::from_str(&kind),
            order: row.get(3)?,
            checksum: row.get(4)?,
            content_type: row.get(5)?,
            remote_url: row.get(6)?,
            has_local_blob: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(&[0x89, b'P', b'N', b'G', 0x0d]), "image/png");
        assert_eq!(sniff_content_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_content_type(&[0xff, 0xd8, 0xff]), "image/jpeg");
    }

    #[test]
    fn test_kind_conversion() {
        assert_eq!(PhotoKind::from_str("after"), PhotoKind::After);
        assert_eq!(PhotoKind::Before.as_str(), "before");
    }
}
