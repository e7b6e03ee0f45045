//! Document-type schema registry
//!
//! Registration stores immutable (name, version) schema payloads;
//! activation moves a per-name pointer. Activation changes are
//! notified on the `schemas_updated` channel so validators can reload
//! without polling.

use super::{queries, DocStore, NOTIFY_SCHEMAS_UPDATED};
use crate::core::error::{RepoError, Result};
use crate::model::{RegisterSchemaRequest, Schema, SchemaEvent, SchemaEventType};

impl DocStore {
    /// Register a schema version and optionally activate it.
    /// Registering an already-stored (name, version) fails with
    /// `Exists`; re-activating the already-active version is a no-op.
    pub async fn register_schema(&self, req: RegisterSchemaRequest) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(spec) = &req.specification {
            queries::register_schema(&mut tx, &req.name, &req.version, spec)
                .await
                .map_err(|e| {
                    if let sqlx::Error::Database(db) = &e {
                        if db.constraint() == Some("document_schema_pkey") {
                            return RepoError::Exists("schema version".into());
                        }
                    }
                    e.into()
                })?;
        }

        if req.activate {
            let changed = queries::activate_schema(&mut tx, &req.name, &req.version).await?;

            if changed > 0 {
                let event = SchemaEvent {
                    event_type: SchemaEventType::Activation,
                    name: req.name.clone(),
                };

                queries::notify(
                    &mut tx,
                    NOTIFY_SCHEMAS_UPDATED,
                    &serde_json::to_string(&event)?,
                )
                .await?;
            }
        }

        tx.commit().await?;

        Ok(())
    }

    /// Deactivate the active schema for a name. Deactivating a name
    /// with no active schema is a no-op and emits no event.
    pub async fn deactivate_schema(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let removed = queries::deactivate_schema(&mut tx, name).await?;

        if removed > 0 {
            let event = SchemaEvent {
                event_type: SchemaEventType::Deactivation,
                name: name.to_string(),
            };

            queries::notify(
                &mut tx,
                NOTIFY_SCHEMAS_UPDATED,
                &serde_json::to_string(&event)?,
            )
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// The active schema for a name, or a specific stored version
    /// when `version` is given.
    pub async fn get_schema(&self, name: &str, version: Option<&str>) -> Result<Schema> {
        let row = match version {
            None => queries::get_active_schema(&self.pool, name).await?,
            Some(v) => queries::get_schema(&self.pool, name, v).await?,
        };

        let row = row.ok_or(RepoError::NotFound)?;

        Ok(Schema {
            name: row.name,
            version: row.version,
            specification: row.spec,
        })
    }

    /// All currently active schemas.
    pub async fn get_active_schemas(&self) -> Result<Vec<Schema>> {
        let rows = queries::get_active_schemas(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| Schema {
                name: row.name,
                version: row.version,
                specification: row.spec,
            })
            .collect())
    }
}
