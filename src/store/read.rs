//! Read path: documents, versions, history, metadata, permissions

use std::collections::BTreeMap;

use uuid::Uuid;

use super::queries;
use super::DocStore;
use crate::core::error::{RepoError, Result};
use crate::model::{AclEntry, DocumentMeta, DocumentUpdate, PermissionCheck, Status};

/// History page size used when the caller does not specify one.
const DEFAULT_HISTORY_COUNT: i64 = 10;
const MAX_HISTORY_COUNT: i64 = 100;

fn decode_meta(value: Option<serde_json::Value>) -> Result<BTreeMap<String, String>> {
    match value {
        Some(v) => Ok(serde_json::from_value(v)?),
        None => Ok(BTreeMap::new()),
    }
}

impl DocStore {
    /// Fetch a document payload. Version 0 returns the current
    /// version.
    pub async fn get_document(&self, uuid: Uuid, version: i64) -> Result<serde_json::Value> {
        if version < 0 {
            return Err(RepoError::bad_input("version cannot be a negative number"));
        }

        let data = if version == 0 {
            queries::get_document_data(&self.pool, uuid).await?
        } else {
            queries::get_document_version_data(&self.pool, uuid, version).await?
        };

        match data {
            None => Err(RepoError::NotFound),
            // The row exists but carries no payload; that is data
            // corruption, not a missing document.
            Some(None) => Err(RepoError::internal(format!(
                "document {uuid} version {version} has no payload"
            ))),
            Some(Some(value)) => Ok(value),
        }
    }

    /// Version metadata without the payload.
    pub async fn get_version(&self, uuid: Uuid, version: i64) -> Result<DocumentUpdate> {
        if version < 1 {
            return Err(RepoError::bad_input("version must be positive"));
        }

        let row = queries::get_version(&self.pool, uuid, version)
            .await?
            .ok_or(RepoError::NotFound)?;

        Ok(DocumentUpdate {
            version: row.version,
            created: row.created,
            creator: row.creator_uri,
            meta: decode_meta(row.meta)?,
        })
    }

    /// Version history, newest first, paginated by "before version".
    /// `before = 0` starts from the latest version; `count = 0` uses
    /// the default page size.
    pub async fn get_version_history(
        &self,
        uuid: Uuid,
        before: i64,
        count: i64,
    ) -> Result<Vec<DocumentUpdate>> {
        if before != 0 && before < 2 {
            return Err(RepoError::bad_input(
                "before cannot be non-zero and less than 2",
            ));
        }

        let count = match count {
            0 => DEFAULT_HISTORY_COUNT,
            c if c < 0 => {
                return Err(RepoError::bad_input("count cannot be negative"));
            }
            c => c.min(MAX_HISTORY_COUNT),
        };

        let rows = queries::get_versions(&self.pool, uuid, before, count).await?;

        let mut updates = Vec::with_capacity(rows.len());
        for row in rows {
            updates.push(DocumentUpdate {
                version: row.version,
                created: row.created,
                creator: row.creator_uri,
                meta: decode_meta(row.meta)?,
            });
        }

        Ok(updates)
    }

    /// Document metadata: current version, timestamps, status heads
    /// and the ACL set. A document marked deleting reports only the
    /// `deleting` flag.
    pub async fn get_document_meta(&self, uuid: Uuid) -> Result<DocumentMeta> {
        let info = queries::get_document_info(&self.pool, uuid)
            .await?
            .ok_or(RepoError::NotFound)?;

        if info.deleting {
            return Ok(DocumentMeta {
                deleting: true,
                ..Default::default()
            });
        }

        let mut meta = DocumentMeta {
            created: info.created,
            modified: info.updated,
            current_version: info.current_version,
            deleting: false,
            ..Default::default()
        };

        for head in queries::get_full_document_heads(&self.pool, uuid).await? {
            let status = Status {
                id: head.id,
                version: head.version,
                creator: head.creator_uri,
                created: head.created,
                meta: decode_meta(head.meta)?,
            };

            meta.statuses.insert(head.name, status);
        }

        for row in queries::get_document_acl(&self.pool, uuid).await? {
            meta.acl.push(AclEntry {
                uri: row.uri,
                permissions: row.permissions,
            });
        }

        Ok(meta)
    }

    /// Status history for one name, newest first.
    pub async fn get_statuses(
        &self,
        uuid: Uuid,
        name: &str,
        before: i64,
        count: i64,
    ) -> Result<Vec<Status>> {
        let count = match count {
            0 => DEFAULT_HISTORY_COUNT,
            c if c < 0 => {
                return Err(RepoError::bad_input("count cannot be negative"));
            }
            c => c.min(MAX_HISTORY_COUNT),
        };

        let rows = queries::get_statuses(&self.pool, uuid, name, before, count).await?;

        let mut statuses = Vec::with_capacity(rows.len());
        for row in rows {
            statuses.push(Status {
                id: row.id,
                version: row.version,
                creator: row.creator_uri,
                created: row.created,
                meta: decode_meta(row.meta)?,
            });
        }

        Ok(statuses)
    }

    /// Resolve the version a read refers to. A positive version and a
    /// status name are mutually exclusive; a status resolves to the
    /// version its head pins.
    pub async fn resolve_read_version(
        &self,
        uuid: Uuid,
        version: i64,
        status: Option<&str>,
    ) -> Result<i64> {
        if version < 0 {
            return Err(RepoError::bad_input("version cannot be a negative number"));
        }

        if version > 0 && status.is_some() {
            return Err(RepoError::bad_input(
                "status cannot be specified together with a version",
            ));
        }

        let Some(name) = status else {
            return Ok(version);
        };

        let meta = self.get_document_meta(uuid).await?;

        match meta.statuses.get(name) {
            Some(head) => Ok(head.version),
            None => Err(RepoError::NotFound),
        }
    }

    /// Check whether any of the grantee URIs holds the permission on
    /// the document.
    pub async fn check_permission(
        &self,
        uuid: Uuid,
        grantee_uris: &[String],
        permission: &str,
    ) -> Result<PermissionCheck> {
        let access =
            queries::check_permission(&self.pool, uuid, grantee_uris, permission).await?;

        Ok(match access {
            None => PermissionCheck::NoSuchDocument,
            Some(false) => PermissionCheck::Denied,
            Some(true) => PermissionCheck::Allowed,
        })
    }
}
