//! Transactional document store over PostgreSQL
//!
//! All mutations run in a single transaction serialized on the
//! document row (`SELECT ... FOR UPDATE`). Change notifications are
//! carried by Postgres NOTIFY and re-delivered to in-process
//! subscribers through [`FanOut`].

mod listener;
pub mod queries;
mod read;
mod schemas;
mod update;

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::fanout::{FanOut, DEFAULT_BUFFER};
use crate::model::{ArchivedEvent, SchemaEvent};

/// Postgres notification channel for archived records
pub const NOTIFY_ARCHIVED: &str = "archived";
/// Postgres notification channel for schema activation changes
pub const NOTIFY_SCHEMAS_UPDATED: &str = "schemas_updated";

/// The document repository store.
#[derive(Clone)]
pub struct DocStore {
    pool: PgPool,
    archived: Arc<FanOut<ArchivedEvent>>,
    schemas: Arc<FanOut<SchemaEvent>>,
}

impl DocStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            archived: FanOut::new(),
            schemas: FanOut::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Subscribe to archived-record events. Best-effort delivery:
    /// events are dropped for subscribers that cannot keep up, and
    /// missed events are not replayed. Subscription ends when the
    /// token is cancelled.
    pub async fn on_archived_update(
        &self,
        token: CancellationToken,
    ) -> mpsc::Receiver<ArchivedEvent> {
        self.archived.subscribe(token, DEFAULT_BUFFER).await
    }

    /// Subscribe to schema activation/deactivation events. Same
    /// best-effort semantics as [`Self::on_archived_update`].
    pub async fn on_schema_update(
        &self,
        token: CancellationToken,
    ) -> mpsc::Receiver<SchemaEvent> {
        self.schemas.subscribe(token, DEFAULT_BUFFER).await
    }

    /// Run the database notification listener until the token is
    /// cancelled. Reconnects with a fixed backoff on connection loss.
    pub async fn run_listener(&self, token: CancellationToken) {
        listener::run(
            self.pool.clone(),
            Arc::clone(&self.archived),
            Arc::clone(&self.schemas),
            token,
        )
        .await;
    }
}
