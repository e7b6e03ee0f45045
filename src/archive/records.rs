//! Canonical archive record forms
//!
//! The blob written to object storage is the JSON serialization of
//! these structs with the signature as the final field. The signed
//! message is the same serialization *without* the signature, so a
//! verifier strips the signature field, re-serializes and checks the
//! result. Field order is fixed by struct declaration order and
//! object keys inside metadata/payload maps are sorted, which makes
//! the byte form canonical.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Archived form of one document version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionArchive {
    pub uuid: Uuid,
    pub version: i64,
    pub created: DateTime<Utc>,
    pub creator_uri: String,
    pub meta: Option<serde_json::Value>,
    pub document_data: serde_json::Value,
    /// Signature of version - 1; empty for version 1
    pub parent_signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl VersionArchive {
    /// The byte form the signature covers.
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let unsigned = Self {
            signature: None,
            ..self.clone()
        };

        serde_json::to_vec(&unsigned)
    }
}

/// Archived form of one status entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusArchive {
    pub uuid: Uuid,
    pub name: String,
    pub id: i64,
    pub version: i64,
    pub created: DateTime<Utc>,
    pub creator_uri: String,
    pub meta: Option<serde_json::Value>,
    /// Signature of the pinned, already-archived version
    pub version_signature: String,
    /// Signature of status id - 1 for the same name; empty for id 1
    pub parent_signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl StatusArchive {
    /// The byte form the signature covers.
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let unsigned = Self {
            signature: None,
            ..self.clone()
        };

        serde_json::to_vec(&unsigned)
    }
}

/// Object key for an archived version:
/// `<prefix>/v/<uuid>/<version>`.
pub fn version_key(prefix: &str, uuid: Uuid, version: i64) -> String {
    if prefix.is_empty() {
        format!("v/{uuid}/{version}")
    } else {
        format!("{prefix}/v/{uuid}/{version}")
    }
}

/// Object key for an archived status:
/// `<prefix>/s/<uuid>/<name>/<id>`.
pub fn status_key(prefix: &str, uuid: Uuid, name: &str, id: i64) -> String {
    if prefix.is_empty() {
        format!("s/{uuid}/{name}/{id}")
    } else {
        format!("{prefix}/s/{uuid}/{name}/{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_version() -> VersionArchive {
        VersionArchive {
            uuid: Uuid::nil(),
            version: 2,
            created: DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            creator_uri: "core://user/alice".into(),
            meta: None,
            document_data: serde_json::json!({"title": "A"}),
            parent_signature: "v1.1.cGFyZW50".into(),
            signature: None,
        }
    }

    #[test]
    fn canonical_bytes_exclude_signature() {
        let mut record = sample_version();
        let unsigned = record.canonical_bytes().unwrap();

        record.signature = Some("v1.1.c2ln".into());
        let signed = record.canonical_bytes().unwrap();

        // Attaching a signature does not change what is signed.
        assert_eq!(unsigned, signed);
        assert!(!String::from_utf8(unsigned).unwrap().contains("signature\":null"));
    }

    #[test]
    fn blob_roundtrip_ends_with_signature_field() {
        let mut record = sample_version();
        record.signature = Some("v1.1.c2ln".into());

        let blob = serde_json::to_string(&record).unwrap();
        assert!(blob.trim_end_matches('}').ends_with("\"signature\":\"v1.1.c2ln\""));

        let decoded: VersionArchive = serde_json::from_str(&blob).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn archive_key_layout() {
        let uuid = Uuid::nil();
        assert_eq!(
            version_key("archive", uuid, 3),
            format!("archive/v/{uuid}/3")
        );
        assert_eq!(
            status_key("archive", uuid, "usable", 1),
            format!("archive/s/{uuid}/usable/1")
        );
        assert_eq!(version_key("", uuid, 1), format!("v/{uuid}/1"));
    }
}
