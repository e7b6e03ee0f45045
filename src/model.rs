//! Domain types for the document repository
//!
//! Requests and results for the store operations, the metadata views,
//! and the notification event types shared between the database
//! channels and the in-process fan-out.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{RepoError, Result};

/// Optimistic concurrency precondition against the document's current
/// version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfMatch {
    /// No precondition
    #[default]
    Any,
    /// The document must not exist yet
    MustNotExist,
    /// The current version must equal this value
    Version(i64),
}

impl IfMatch {
    /// Decode the wire representation: 0 = any, -1 = must not exist,
    /// positive = exact version.
    pub fn from_raw(raw: i64) -> Result<Self> {
        match raw {
            0 => Ok(Self::Any),
            -1 => Ok(Self::MustNotExist),
            v if v > 0 => Ok(Self::Version(v)),
            v => Err(RepoError::BadInput(format!(
                "invalid if_match value {v}"
            ))),
        }
    }
}

/// One status entry to append in an update. A `version` of 0 pins the
/// version produced by the same update (or the current version when
/// the update carries no payload).
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub name: String,
    pub version: i64,
    pub meta: BTreeMap<String, String>,
}

/// An access control entry: the permissions a grantee URI holds on a
/// document. Entries with an empty permission set are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub uri: String,
    pub permissions: Vec<String>,
}

/// Input for [`DocStore::update`](crate::store::DocStore::update).
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub uuid: Uuid,
    /// Document URI, unique among live documents
    pub uri: String,
    /// Document type identifier
    pub doc_type: String,
    /// New version payload; when `None` no new version is created
    pub document: Option<serde_json::Value>,
    /// Opaque update metadata stored on the version row
    pub meta: BTreeMap<String, String>,
    pub if_match: IfMatch,
    pub status: Vec<StatusUpdate>,
    /// ACL replacement set; empty means "leave unchanged" for
    /// existing documents
    pub acl: Vec<AclEntry>,
    /// ACL applied on first creation when `acl` is empty
    pub default_acl: Vec<AclEntry>,
    pub updater: String,
    pub updated: DateTime<Utc>,
}

/// Input for [`DocStore::delete`](crate::store::DocStore::delete).
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub uuid: Uuid,
    pub if_match: IfMatch,
    pub updater: String,
    pub updated: DateTime<Utc>,
    pub meta: BTreeMap<String, String>,
}

/// A committed update: the version it is associated with plus the
/// recorded creator and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpdate {
    pub version: i64,
    pub creator: String,
    pub created: DateTime<Utc>,
    pub meta: BTreeMap<String, String>,
}

/// A status head entry as reported by document metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: i64,
    pub version: i64,
    pub creator: String,
    pub created: DateTime<Utc>,
    pub meta: BTreeMap<String, String>,
}

/// Metadata view of a document. For documents marked deleting only
/// the `deleting` flag is populated.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub current_version: i64,
    /// Per-name status heads
    pub statuses: HashMap<String, Status>,
    pub acl: Vec<AclEntry>,
    pub deleting: bool,
}

impl Default for DocumentMeta {
    fn default() -> Self {
        Self {
            created: DateTime::<Utc>::UNIX_EPOCH,
            modified: DateTime::<Utc>::UNIX_EPOCH,
            current_version: 0,
            statuses: HashMap::new(),
            acl: Vec::new(),
            deleting: false,
        }
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionCheck {
    Allowed,
    Denied,
    NoSuchDocument,
}

/// A registered document-type schema.
#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub version: String,
    pub specification: serde_json::Value,
}

/// Input for schema registration.
#[derive(Debug, Clone)]
pub struct RegisterSchemaRequest {
    pub name: String,
    pub version: String,
    /// When `None` no new schema version is stored; combined with
    /// `activate` this switches the active pointer only.
    pub specification: Option<serde_json::Value>,
    pub activate: bool,
}

/// The kind of record an archived notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivedKind {
    Version,
    Status,
}

/// Emitted after the archiver commits an archived mark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedEvent {
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub kind: ArchivedKind,
    /// Status name; `None` for versions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Version number or status id, depending on `kind`
    pub id: i64,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaEventType {
    Activation,
    Deactivation,
}

/// Emitted when a schema is activated or deactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEvent {
    #[serde(rename = "type")]
    pub event_type: SchemaEventType,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn if_match_wire_decoding() {
        assert_eq!(IfMatch::from_raw(0).unwrap(), IfMatch::Any);
        assert_eq!(IfMatch::from_raw(-1).unwrap(), IfMatch::MustNotExist);
        assert_eq!(IfMatch::from_raw(7).unwrap(), IfMatch::Version(7));
        assert!(IfMatch::from_raw(-2).is_err());
    }

    #[test]
    fn archived_event_payload_roundtrip() {
        let event = ArchivedEvent {
            uuid: Uuid::new_v4(),
            kind: ArchivedKind::Status,
            name: Some("usable".into()),
            id: 3,
            signature: "v1.1.c2ln".into(),
        };

        let payload = serde_json::to_string(&event).unwrap();
        let decoded: ArchivedEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded, event);

        // Version events omit the status name entirely.
        let event = ArchivedEvent {
            uuid: Uuid::new_v4(),
            kind: ArchivedKind::Version,
            name: None,
            id: 1,
            signature: "v1.1.c2ln".into(),
        };
        let payload = serde_json::to_string(&event).unwrap();
        assert!(!payload.contains("name"));
        assert_eq!(
            serde_json::from_str::<ArchivedEvent>(&payload).unwrap(),
            event
        );
    }
}
