//! Write path: Update and Delete
//!
//! Serialization work happens before the transaction starts so row
//! locks are never held during busy-work. The transaction locks the
//! document row, evaluates the IfMatch precondition, then applies
//! version, status, ACL and audit writes as one unit.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use uuid::Uuid;

use super::queries;
use super::DocStore;
use crate::core::error::{RepoError, Result};
use crate::model::{AclEntry, DeleteRequest, DocumentUpdate, IfMatch, UpdateRequest};

/// Document state read under the row lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct Preflight {
    pub exists: bool,
    pub uri: String,
    pub doc_type: String,
    pub current_version: i64,
}

/// Evaluate the IfMatch precondition against locked document state.
/// Exposed for the store internals; the locking read itself lives in
/// [`update_preflight`].
pub(crate) fn check_if_match(
    if_match: IfMatch,
    exists: bool,
    current_version: i64,
) -> Result<()> {
    match if_match {
        IfMatch::Any => Ok(()),
        IfMatch::MustNotExist if exists => Err(RepoError::OptimisticLock {
            expected: -1,
            actual: current_version,
        }),
        IfMatch::MustNotExist => Ok(()),
        IfMatch::Version(expected) if current_version != expected => {
            Err(RepoError::OptimisticLock {
                expected,
                actual: current_version,
            })
        }
        IfMatch::Version(_) => Ok(()),
    }
}

/// Lock the document row and check deleting flag + IfMatch.
pub(crate) async fn update_preflight(
    conn: &mut PgConnection,
    uuid: Uuid,
    if_match: IfMatch,
) -> Result<Preflight> {
    let info = queries::get_document_for_update(conn, uuid).await?;

    let preflight = match info {
        Some(row) => {
            if row.deleting {
                return Err(RepoError::DeleteLock);
            }

            Preflight {
                exists: true,
                uri: row.uri,
                doc_type: row.doc_type,
                current_version: row.current_version,
            }
        }
        None => Preflight::default(),
    };

    check_if_match(if_match, preflight.exists, preflight.current_version)?;

    Ok(preflight)
}

/// Marshal a string map to its stored JSON form. Empty maps are
/// stored as NULL, matching how reads treat absent metadata.
fn marshal_meta(meta: &BTreeMap<String, String>) -> Result<Option<serde_json::Value>> {
    if meta.is_empty() {
        return Ok(None);
    }

    Ok(Some(serde_json::to_value(meta)?))
}

/// Decide which ACL list an update applies: an explicit list always
/// wins, the default list only applies on first creation, and an
/// empty list on an existing document leaves the ACL unchanged.
pub(crate) fn effective_acl<'a>(
    acl: &'a [AclEntry],
    default_acl: &'a [AclEntry],
    exists: bool,
) -> &'a [AclEntry] {
    if !acl.is_empty() {
        acl
    } else if !exists {
        default_acl
    } else {
        &[]
    }
}

impl DocStore {
    /// Atomically commit a new version, status entries, ACL changes
    /// and the audit entry for one document.
    ///
    /// Returns the version the update is associated with: the newly
    /// created version when a payload was supplied, the current one
    /// otherwise.
    pub async fn update(&self, req: UpdateRequest) -> Result<DocumentUpdate> {
        let meta_json = marshal_meta(&req.meta)?;

        let mut status_meta = Vec::with_capacity(req.status.len());
        for status in &req.status {
            status_meta.push(marshal_meta(&status.meta)?);
        }

        let mut tx = self.pool.begin().await?;

        let info = update_preflight(&mut tx, req.uuid, req.if_match).await?;

        if req.document.is_none() && !info.exists {
            return Err(RepoError::bad_input(
                "a document payload is required to create a document",
            ));
        }

        let mut up = DocumentUpdate {
            version: info.current_version,
            created: req.updated,
            creator: req.updater.clone(),
            meta: req.meta.clone(),
        };

        if let Some(document) = &req.document {
            up.version += 1;

            queries::upsert_document(
                &mut tx,
                req.uuid,
                &req.uri,
                &req.doc_type,
                up.created,
                &up.creator,
                up.version,
            )
            .await
            .map_err(|e| constraint_error(e, "document_uri_live_idx", "document uri"))?;

            queries::create_version(
                &mut tx,
                req.uuid,
                up.version,
                up.created,
                &up.creator,
                meta_json.as_ref(),
                document,
            )
            .await?;
        }

        if !req.status.is_empty() {
            let mut heads: HashMap<String, i64> = HashMap::new();

            for head in queries::get_document_heads(&mut tx, req.uuid).await? {
                heads.insert(head.name, head.current_id);
            }

            for (i, status) in req.status.iter().enumerate() {
                let version = resolve_status_version(status.version, up.version)?;

                let id = heads.get(status.name.as_str()).copied().unwrap_or(0) + 1;
                heads.insert(status.name.clone(), id);

                queries::create_status(
                    &mut tx,
                    req.uuid,
                    &status.name,
                    id,
                    version,
                    up.created,
                    &up.creator,
                    status_meta[i].as_ref(),
                )
                .await?;

                queries::upsert_status_head(
                    &mut tx, req.uuid, &status.name, id, up.created, &up.creator,
                )
                .await?;
            }
        }

        let acl = effective_acl(&req.acl, &req.default_acl, info.exists);

        update_acl(&mut tx, req.uuid, acl, req.updated, &req.updater).await?;

        tx.commit().await?;

        Ok(up)
    }

    /// Mark a document for deletion.
    ///
    /// Idempotent: deleting a document that does not exist succeeds.
    /// Rows are not removed here; the deleter finalises once every
    /// record has been archived.
    pub async fn delete(&self, req: DeleteRequest) -> Result<()> {
        let meta_json = marshal_meta(&req.meta)?;

        let mut tx = self.pool.begin().await?;

        let info = update_preflight(&mut tx, req.uuid, req.if_match).await?;

        if !info.exists {
            return Ok(());
        }

        let record_id = queries::insert_delete_record(
            &mut tx,
            req.uuid,
            &info.uri,
            &info.doc_type,
            info.current_version,
            req.updated,
            &req.updater,
            meta_json.as_ref(),
        )
        .await?;

        queries::mark_document_deleting(&mut tx, req.uuid, req.updated, &req.updater, record_id)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            uuid = %req.uuid,
            delete_record = record_id,
            "Document marked for deletion"
        );

        Ok(())
    }
}

/// A pinned version of 0 resolves to the version this update is
/// associated with. Anything outside 1..=current is rejected rather
/// than left to stall the archive chain.
fn resolve_status_version(pinned: i64, update_version: i64) -> Result<i64> {
    let version = if pinned == 0 { update_version } else { pinned };

    if version < 1 || version > update_version {
        return Err(RepoError::BadInput(format!(
            "status pins version {version}, but document has versions 1..={update_version}"
        )));
    }

    Ok(version)
}

/// Replace ACL entries and snapshot the result into the audit trail.
/// Entries with an empty permission set are dropped immediately.
async fn update_acl(
    conn: &mut PgConnection,
    uuid: Uuid,
    entries: &[AclEntry],
    updated: DateTime<Utc>,
    updater: &str,
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    if updater.is_empty() {
        return Err(RepoError::Unauthenticated);
    }

    for entry in entries {
        if entry.permissions.is_empty() {
            queries::drop_acl(conn, uuid, &entry.uri).await?;
        } else {
            queries::upsert_acl(conn, uuid, &entry.uri, &entry.permissions).await?;
        }
    }

    queries::insert_acl_audit(conn, uuid, updated, updater).await?;

    Ok(())
}

/// Map a named-constraint violation to `Exists`; pass every other
/// database error through.
fn constraint_error(err: sqlx::Error, constraint: &str, resource: &str) -> RepoError {
    if let sqlx::Error::Database(db) = &err {
        if db.constraint() == Some(constraint) {
            return RepoError::Exists(resource.to_string());
        }
    }

    err.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn if_match_preflight_table() {
        // No precondition always passes.
        assert!(check_if_match(IfMatch::Any, false, 0).is_ok());
        assert!(check_if_match(IfMatch::Any, true, 4).is_ok());

        // Creation guard.
        assert!(check_if_match(IfMatch::MustNotExist, false, 0).is_ok());
        assert!(matches!(
            check_if_match(IfMatch::MustNotExist, true, 1),
            Err(RepoError::OptimisticLock { .. })
        ));

        // Exact version; a missing document reads as version 0 and
        // therefore never matches a positive expectation.
        assert!(check_if_match(IfMatch::Version(3), true, 3).is_ok());
        assert!(matches!(
            check_if_match(IfMatch::Version(3), true, 4),
            Err(RepoError::OptimisticLock {
                expected: 3,
                actual: 4
            })
        ));
        assert!(check_if_match(IfMatch::Version(3), false, 0).is_err());
    }

    #[test]
    fn status_version_resolution() {
        // 0 pins the update's own version.
        assert_eq!(resolve_status_version(0, 5).unwrap(), 5);
        assert_eq!(resolve_status_version(2, 5).unwrap(), 2);

        // Nothing outside the existing version range.
        assert!(resolve_status_version(6, 5).is_err());
        assert!(resolve_status_version(-2, 5).is_err());
        assert!(resolve_status_version(0, 0).is_err());
    }

    #[test]
    fn acl_selection() {
        let explicit = vec![AclEntry {
            uri: "core://user/alice".into(),
            permissions: vec!["read".into()],
        }];
        let default = vec![AclEntry {
            uri: "core://unit/desk".into(),
            permissions: vec!["read".into(), "write".into()],
        }];

        // Explicit list always wins.
        assert_eq!(effective_acl(&explicit, &default, true), &explicit[..]);
        assert_eq!(effective_acl(&explicit, &default, false), &explicit[..]);

        // Defaults only apply on creation.
        assert_eq!(effective_acl(&[], &default, false), &default[..]);
        assert!(effective_acl(&[], &default, true).is_empty());
    }

    #[test]
    fn empty_meta_is_stored_as_null() {
        assert_eq!(marshal_meta(&BTreeMap::new()).unwrap(), None);

        let mut meta = BTreeMap::new();
        meta.insert("reason".to_string(), "edited".to_string());
        let value = marshal_meta(&meta).unwrap().unwrap();
        assert_eq!(value["reason"], "edited");
    }
}
