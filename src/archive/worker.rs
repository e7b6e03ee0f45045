//! Archiver worker
//!
//! Advances each document's archive chain: versions in order, then
//! statuses once their pinned version is signed. Candidates are
//! claimed with FOR UPDATE SKIP LOCKED and the claim transaction is
//! held across the object-store write, so concurrent archiver
//! instances never process the same row. The blob goes to object
//! storage before the row is marked archived; a crash in between
//! leaves the row unarchived and the idempotent put re-covers it on
//! the next pass.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::object_store::ObjectStore;
use super::records::{status_key, version_key, StatusArchive, VersionArchive};
use super::signer::{SigningKey, SigningKeySet};
use crate::core::error::{RepoError, Result};
use crate::model::{ArchivedEvent, ArchivedKind};
use crate::store::queries;
use crate::store::NOTIFY_ARCHIVED;

/// Wait between polls when no work is pending
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Wait after a transient failure
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Idle cycles with pending records before a stall is reported
const STALL_REPORT_CYCLES: u32 = 30;

const BLOB_CONTENT_TYPE: &str = "application/json";

/// Load the signing key set, generating and storing a key when none
/// exists yet. Runs under an advisory lock so concurrent instances
/// agree on one generated key.
pub async fn load_or_bootstrap_keys(
    pool: &PgPool,
    configured: Option<&str>,
) -> Result<SigningKeySet> {
    let mut tx = pool.begin().await?;

    queries::acquire_tx_lock(&mut tx, queries::LOCK_SIGNING_KEYS).await?;

    let rows = queries::get_signing_keys(&mut tx).await?;

    let mut set = SigningKeySet::new();

    if rows.is_empty() {
        let kid = set.next_kid();

        let (key, spec) = match configured {
            Some(b64) => SigningKey::from_private_b64(&kid, b64)?,
            None => {
                tracing::warn!("No configured signing key, generating one");
                SigningKey::generate(&kid)?
            }
        };

        queries::insert_signing_key(&mut tx, key.kid(), &serde_json::to_value(&spec)?).await?;

        tracing::info!(kid = key.kid(), "Stored new signing key");
        set.insert(key);
    } else {
        for row in rows {
            let spec = serde_json::from_value(row.spec)?;
            set.insert(SigningKey::from_spec(&row.kid, &spec)?);
        }
    }

    tx.commit().await?;

    Ok(set)
}

/// Background worker lifting versions and statuses into the archive.
pub struct Archiver {
    pool: PgPool,
    objects: Arc<dyn ObjectStore>,
    prefix: String,
    keys: RwLock<SigningKeySet>,
}

impl Archiver {
    pub fn new(
        pool: PgPool,
        objects: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        keys: SigningKeySet,
    ) -> Self {
        Self {
            pool,
            objects,
            prefix: prefix.into(),
            keys: RwLock::new(keys),
        }
    }

    /// Run until the token is cancelled. Errors are logged and
    /// retried after a backoff; they never surface to callers.
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!("Archiver started");

        let mut idle_cycles: u32 = 0;

        loop {
            if token.is_cancelled() {
                break;
            }

            match self.archive_next().await {
                Ok(true) => {
                    idle_cycles = 0;
                    continue;
                }
                Ok(false) => {
                    idle_cycles += 1;

                    if idle_cycles >= STALL_REPORT_CYCLES {
                        idle_cycles = 0;
                        self.report_stall().await;
                    }

                    if !sleep_cancellable(&token, POLL_INTERVAL).await {
                        break;
                    }
                }
                Err(e) => {
                    if matches!(e, RepoError::Internal(_)) {
                        // Key-set problems may resolve after a
                        // rotation lands; re-query before retrying.
                        self.reload_keys().await;
                    }

                    tracing::error!(error = %e, "Archiving cycle failed, backing off");

                    if !sleep_cancellable(&token, ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("Archiver stopped");
    }

    /// Archive one record if any is ready. Versions take precedence
    /// so status chains can follow the versions they pin.
    async fn archive_next(&self) -> Result<bool> {
        if self.archive_next_version().await? {
            return Ok(true);
        }

        self.archive_next_status().await
    }

    async fn archive_next_version(&self) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = queries::get_version_for_archiving(&mut tx).await? else {
            return Ok(false);
        };

        let parent_signature = match row.parent_signature {
            Some(sig) => sig,
            None if row.version == 1 => String::new(),
            None => {
                return Err(RepoError::internal(format!(
                    "version {} of {} has an archived parent without a signature",
                    row.version, row.uuid
                )));
            }
        };

        let document_data = row.document_data.ok_or_else(|| {
            RepoError::internal(format!(
                "version {} of {} has no payload to archive",
                row.version, row.uuid
            ))
        })?;

        let mut record = VersionArchive {
            uuid: row.uuid,
            version: row.version,
            created: row.created,
            creator_uri: row.creator_uri,
            meta: row.meta,
            document_data,
            parent_signature,
            signature: None,
        };

        let signature = self.keys.read().await.sign(&record.canonical_bytes()?)?;
        record.signature = Some(signature.clone());

        let key = version_key(&self.prefix, record.uuid, record.version);

        self.objects
            .put(&key, serde_json::to_vec(&record)?, BLOB_CONTENT_TYPE)
            .await?;

        queries::set_version_archived(&mut tx, record.uuid, record.version, &signature).await?;

        let event = ArchivedEvent {
            uuid: record.uuid,
            kind: ArchivedKind::Version,
            name: None,
            id: record.version,
            signature,
        };

        queries::notify(&mut tx, NOTIFY_ARCHIVED, &serde_json::to_string(&event)?).await?;

        tx.commit().await?;

        tracing::debug!(uuid = %record.uuid, version = record.version, "Archived version");

        Ok(true)
    }

    async fn archive_next_status(&self) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = queries::get_status_for_archiving(&mut tx).await? else {
            return Ok(false);
        };

        let parent_signature = match row.parent_signature {
            Some(sig) => sig,
            None if row.id == 1 => String::new(),
            None => {
                return Err(RepoError::internal(format!(
                    "status {}/{} of {} has an archived parent without a signature",
                    row.name, row.id, row.uuid
                )));
            }
        };

        let version_signature = row.version_signature.ok_or_else(|| {
            RepoError::internal(format!(
                "status {}/{} of {} pins version {} which is archived but unsigned",
                row.name, row.id, row.uuid, row.version
            ))
        })?;

        let mut record = StatusArchive {
            uuid: row.uuid,
            name: row.name,
            id: row.id,
            version: row.version,
            created: row.created,
            creator_uri: row.creator_uri,
            meta: row.meta,
            version_signature,
            parent_signature,
            signature: None,
        };

        let signature = self.keys.read().await.sign(&record.canonical_bytes()?)?;
        record.signature = Some(signature.clone());

        let key = status_key(&self.prefix, record.uuid, &record.name, record.id);

        self.objects
            .put(&key, serde_json::to_vec(&record)?, BLOB_CONTENT_TYPE)
            .await?;

        queries::set_status_archived(&mut tx, record.uuid, &record.name, record.id, &signature)
            .await?;

        let event = ArchivedEvent {
            uuid: record.uuid,
            kind: ArchivedKind::Status,
            name: Some(record.name.clone()),
            id: record.id,
            signature,
        };

        queries::notify(&mut tx, NOTIFY_ARCHIVED, &serde_json::to_string(&event)?).await?;

        tx.commit().await?;

        tracing::debug!(
            uuid = %record.uuid,
            name = %record.name,
            id = record.id,
            "Archived status"
        );

        Ok(true)
    }

    /// Records that stay unarchived while no candidate is claimable
    /// are stuck behind a missing parent or an unsigned pinned
    /// version.
    async fn report_stall(&self) {
        match queries::count_unarchived_total(&self.pool).await {
            Ok(0) => {}
            Ok(pending) => {
                tracing::warn!(
                    pending,
                    "Archive chain stalled: unarchived records with no claimable candidate"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to count unarchived records");
            }
        }
    }

    async fn reload_keys(&self) {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!(error = %e, "Failed to re-query signing keys");
                return;
            }
        };

        let rows = match queries::get_signing_keys(&mut tx).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "Failed to re-query signing keys");
                return;
            }
        };

        let mut set = SigningKeySet::new();

        for row in rows {
            let spec = match serde_json::from_value(row.spec) {
                Ok(spec) => spec,
                Err(e) => {
                    tracing::error!(kid = %row.kid, error = %e, "Invalid stored key spec");
                    continue;
                }
            };

            match SigningKey::from_spec(&row.kid, &spec) {
                Ok(key) => set.insert(key),
                Err(e) => {
                    tracing::error!(kid = %row.kid, error = %e, "Unusable stored key");
                }
            }
        }

        if !set.is_empty() {
            *self.keys.write().await = set;
        }
    }
}

/// Sleep unless the token fires first; returns false on cancellation.
async fn sleep_cancellable(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
