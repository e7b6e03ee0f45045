//! Database notification listener
//!
//! Attaches a dedicated connection to the Postgres notification
//! channels, decodes payloads and feeds the in-process fan-outs. On
//! connection loss the listener reconnects with a fixed backoff and
//! resubscribes to all channels.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use super::{NOTIFY_ARCHIVED, NOTIFY_SCHEMAS_UPDATED};
use crate::fanout::FanOut;
use crate::model::{ArchivedEvent, SchemaEvent};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

pub(super) async fn run(
    pool: PgPool,
    archived: Arc<FanOut<ArchivedEvent>>,
    schemas: Arc<FanOut<SchemaEvent>>,
    token: CancellationToken,
) {
    tracing::info!("Notification listener started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            res = listen(&pool, &archived, &schemas) => {
                // listen() only returns on error.
                if let Err(e) = res {
                    tracing::error!(error = %e, "Notification listener failed, reconnecting");
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }

    tracing::info!("Notification listener stopped");
}

async fn listen(
    pool: &PgPool,
    archived: &FanOut<ArchivedEvent>,
    schemas: &FanOut<SchemaEvent>,
) -> sqlx::Result<()> {
    let mut listener = PgListener::connect_with(pool).await?;

    listener
        .listen_all([NOTIFY_ARCHIVED, NOTIFY_SCHEMAS_UPDATED])
        .await?;

    loop {
        let notification = listener.recv().await?;

        match notification.channel() {
            NOTIFY_ARCHIVED => {
                match serde_json::from_str::<ArchivedEvent>(notification.payload()) {
                    Ok(event) => archived.publish(event).await,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            payload = notification.payload(),
                            "Discarding undecodable archived notification"
                        );
                    }
                }
            }
            NOTIFY_SCHEMAS_UPDATED => {
                match serde_json::from_str::<SchemaEvent>(notification.payload()) {
                    Ok(event) => schemas.publish(event).await,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            payload = notification.payload(),
                            "Discarding undecodable schema notification"
                        );
                    }
                }
            }
            other => {
                tracing::debug!(channel = other, "Ignoring unexpected notification channel");
            }
        }
    }
}
