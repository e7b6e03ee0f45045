//! Deleter worker
//!
//! Finalises document deletion once archiving has drained. Documents
//! marked deleting are claimed oldest-first with FOR UPDATE SKIP
//! LOCKED; a claim with unarchived records left is released and
//! retried on a later pass. The row delete carries the
//! `deleting = true` predicate and cascades to versions, statuses and
//! ACL entries. Delete records are kept.

use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::core::error::Result;
use crate::store::queries;

/// Polling window between passes
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Wait after a failure
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct Deleter {
    pool: PgPool,
}

impl Deleter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run until the token is cancelled. Errors are logged and
    /// retried; they never surface to callers.
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!("Deleter started");

        loop {
            if token.is_cancelled() {
                break;
            }

            let wait = match self.delete_next().await {
                // Work done: immediately look for the next claim.
                Ok(true) => continue,
                Ok(false) => POLL_INTERVAL,
                Err(e) => {
                    tracing::error!(error = %e, "Delete pass failed, backing off");
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!("Deleter stopped");
    }

    /// Claim one deleting document and remove it if its archive has
    /// drained. Returns whether a row was removed.
    async fn delete_next(&self) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(doc) = queries::get_document_for_deletion(&mut tx).await? else {
            return Ok(false);
        };

        let remaining = queries::get_document_unarchived_count(&mut tx, doc.uuid).await?;

        if remaining > 0 {
            // Release the claim; the archiver has not caught up yet.
            tracing::debug!(
                uuid = %doc.uuid,
                remaining,
                "Deferring delete until archiving drains"
            );
            return Ok(false);
        }

        let removed = queries::finalise_delete(&mut tx, doc.uuid).await?;

        tx.commit().await?;

        if removed > 0 {
            tracing::info!(
                uuid = %doc.uuid,
                delete_record = ?doc.delete_record_id,
                "Document deleted"
            );
        }

        Ok(removed > 0)
    }
}
