//! Hand-written SQL for the repository database
//!
//! One free function per query. Functions that must run inside the
//! caller's transaction take `&mut PgConnection`; plain reads take
//! `&PgPool`. Row structs mirror the selected columns only.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use sqlx::PgPool;
use uuid::Uuid;

/// Advisory lock id guarding signing-key bootstrap.
pub const LOCK_SIGNING_KEYS: i64 = 0x6476_0001;

// ════════════════════════════════════════════════════════════════
// Document rows
// ════════════════════════════════════════════════════════════════

/// Columns read under the per-document write lock.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentForUpdate {
    pub uri: String,
    #[sqlx(rename = "type")]
    pub doc_type: String,
    pub current_version: i64,
    pub deleting: bool,
}

/// Lock the document row for the duration of the transaction. This is
/// the serialization point for all writes to one document.
pub async fn get_document_for_update(
    conn: &mut PgConnection,
    uuid: Uuid,
) -> sqlx::Result<Option<DocumentForUpdate>> {
    sqlx::query_as::<_, DocumentForUpdate>(
        "SELECT uri, type, current_version, deleting FROM document \
         WHERE uuid = $1 FOR UPDATE",
    )
    .bind(uuid)
    .fetch_optional(conn)
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn upsert_document(
    conn: &mut PgConnection,
    uuid: Uuid,
    uri: &str,
    doc_type: &str,
    updated: DateTime<Utc>,
    updater_uri: &str,
    current_version: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO document (
            uuid, uri, type, created, creator_uri,
            updated, updater_uri, current_version, deleting
        )
        VALUES ($1, $2, $3, $4, $5, $4, $5, $6, false)
        ON CONFLICT (uuid) DO UPDATE SET
            uri = EXCLUDED.uri,
            updated = EXCLUDED.updated,
            updater_uri = EXCLUDED.updater_uri,
            current_version = EXCLUDED.current_version
        "#,
    )
    .bind(uuid)
    .bind(uri)
    .bind(doc_type)
    .bind(updated)
    .bind(updater_uri)
    .bind(current_version)
    .execute(conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentInfo {
    pub uri: String,
    #[sqlx(rename = "type")]
    pub doc_type: String,
    pub created: DateTime<Utc>,
    pub creator_uri: String,
    pub updated: DateTime<Utc>,
    pub updater_uri: String,
    pub current_version: i64,
    pub deleting: bool,
}

pub async fn get_document_info(
    pool: &PgPool,
    uuid: Uuid,
) -> sqlx::Result<Option<DocumentInfo>> {
    sqlx::query_as::<_, DocumentInfo>(
        "SELECT uri, type, created, creator_uri, updated, updater_uri, \
                current_version, deleting \
         FROM document WHERE uuid = $1",
    )
    .bind(uuid)
    .fetch_optional(pool)
    .await
}

// ════════════════════════════════════════════════════════════════
// Versions
// ════════════════════════════════════════════════════════════════

pub async fn create_version(
    conn: &mut PgConnection,
    uuid: Uuid,
    version: i64,
    created: DateTime<Utc>,
    creator_uri: &str,
    meta: Option<&serde_json::Value>,
    document_data: &serde_json::Value,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO document_version ( \
             uuid, version, created, creator_uri, meta, document_data, archived \
         ) VALUES ($1, $2, $3, $4, $5, $6, false)",
    )
    .bind(uuid)
    .bind(version)
    .bind(created)
    .bind(creator_uri)
    .bind(meta)
    .bind(document_data)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn get_document_data(
    pool: &PgPool,
    uuid: Uuid,
) -> sqlx::Result<Option<Option<serde_json::Value>>> {
    sqlx::query_scalar::<_, Option<serde_json::Value>>(
        "SELECT v.document_data \
         FROM document AS d \
              INNER JOIN document_version AS v \
                    ON v.uuid = d.uuid AND v.version = d.current_version \
         WHERE d.uuid = $1",
    )
    .bind(uuid)
    .fetch_optional(pool)
    .await
}

pub async fn get_document_version_data(
    pool: &PgPool,
    uuid: Uuid,
    version: i64,
) -> sqlx::Result<Option<Option<serde_json::Value>>> {
    sqlx::query_scalar::<_, Option<serde_json::Value>>(
        "SELECT document_data FROM document_version \
         WHERE uuid = $1 AND version = $2",
    )
    .bind(uuid)
    .bind(version)
    .fetch_optional(pool)
    .await
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VersionInfo {
    pub version: i64,
    pub created: DateTime<Utc>,
    pub creator_uri: String,
    pub meta: Option<serde_json::Value>,
    pub archived: bool,
}

pub async fn get_version(
    pool: &PgPool,
    uuid: Uuid,
    version: i64,
) -> sqlx::Result<Option<VersionInfo>> {
    sqlx::query_as::<_, VersionInfo>(
        "SELECT version, created, creator_uri, meta, archived \
         FROM document_version WHERE uuid = $1 AND version = $2",
    )
    .bind(uuid)
    .bind(version)
    .fetch_optional(pool)
    .await
}

/// Version history, newest first. `before = 0` starts from the
/// latest version.
pub async fn get_versions(
    pool: &PgPool,
    uuid: Uuid,
    before: i64,
    count: i64,
) -> sqlx::Result<Vec<VersionInfo>> {
    sqlx::query_as::<_, VersionInfo>(
        "SELECT version, created, creator_uri, meta, archived \
         FROM document_version \
         WHERE uuid = $1 AND ($2::bigint = 0 OR version < $2::bigint) \
         ORDER BY version DESC \
         LIMIT $3",
    )
    .bind(uuid)
    .bind(before)
    .bind(count)
    .fetch_all(pool)
    .await
}

// ════════════════════════════════════════════════════════════════
// Statuses and heads
// ════════════════════════════════════════════════════════════════

#[allow(clippy::too_many_arguments)]
pub async fn create_status(
    conn: &mut PgConnection,
    uuid: Uuid,
    name: &str,
    id: i64,
    version: i64,
    created: DateTime<Utc>,
    creator_uri: &str,
    meta: Option<&serde_json::Value>,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO document_status ( \
             uuid, name, id, version, created, creator_uri, meta, archived \
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, false)",
    )
    .bind(uuid)
    .bind(name)
    .bind(id)
    .bind(version)
    .bind(created)
    .bind(creator_uri)
    .bind(meta)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn upsert_status_head(
    conn: &mut PgConnection,
    uuid: Uuid,
    name: &str,
    current_id: i64,
    updated: DateTime<Utc>,
    updater_uri: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO status_heads (uuid, name, current_id, updated, updater_uri)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (uuid, name) DO UPDATE SET
            current_id = EXCLUDED.current_id,
            updated = EXCLUDED.updated,
            updater_uri = EXCLUDED.updater_uri
        "#,
    )
    .bind(uuid)
    .bind(name)
    .bind(current_id)
    .bind(updated)
    .bind(updater_uri)
    .execute(conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatusHead {
    pub name: String,
    pub current_id: i64,
}

pub async fn get_document_heads(
    conn: &mut PgConnection,
    uuid: Uuid,
) -> sqlx::Result<Vec<StatusHead>> {
    sqlx::query_as::<_, StatusHead>(
        "SELECT name, current_id FROM status_heads WHERE uuid = $1",
    )
    .bind(uuid)
    .fetch_all(conn)
    .await
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatusRow {
    pub name: String,
    pub id: i64,
    pub version: i64,
    pub created: DateTime<Utc>,
    pub creator_uri: String,
    pub meta: Option<serde_json::Value>,
}

/// The full head row for every status name set on the document.
pub async fn get_full_document_heads(
    pool: &PgPool,
    uuid: Uuid,
) -> sqlx::Result<Vec<StatusRow>> {
    sqlx::query_as::<_, StatusRow>(
        "SELECT s.name, s.id, s.version, s.created, s.creator_uri, s.meta \
         FROM status_heads AS h \
              INNER JOIN document_status AS s \
                    ON s.uuid = h.uuid AND s.name = h.name AND s.id = h.current_id \
         WHERE h.uuid = $1",
    )
    .bind(uuid)
    .fetch_all(pool)
    .await
}

/// Status history for one name, newest first. `before = 0` starts
/// from the head.
pub async fn get_statuses(
    pool: &PgPool,
    uuid: Uuid,
    name: &str,
    before: i64,
    count: i64,
) -> sqlx::Result<Vec<StatusRow>> {
    sqlx::query_as::<_, StatusRow>(
        "SELECT name, id, version, created, creator_uri, meta \
         FROM document_status \
         WHERE uuid = $1 AND name = $2 AND ($3::bigint = 0 OR id < $3::bigint) \
         ORDER BY id DESC \
         LIMIT $4",
    )
    .bind(uuid)
    .bind(name)
    .bind(before)
    .bind(count)
    .fetch_all(pool)
    .await
}

// ════════════════════════════════════════════════════════════════
// ACL
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AclRow {
    pub uri: String,
    pub permissions: Vec<String>,
}

pub async fn get_document_acl(pool: &PgPool, uuid: Uuid) -> sqlx::Result<Vec<AclRow>> {
    sqlx::query_as::<_, AclRow>(
        "SELECT uri, permissions FROM acl WHERE uuid = $1 ORDER BY uri",
    )
    .bind(uuid)
    .fetch_all(pool)
    .await
}

pub async fn drop_acl(conn: &mut PgConnection, uuid: Uuid, uri: &str) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM acl WHERE uuid = $1 AND uri = $2")
        .bind(uuid)
        .bind(uri)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn upsert_acl(
    conn: &mut PgConnection,
    uuid: Uuid,
    uri: &str,
    permissions: &[String],
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO acl (uuid, uri, permissions)
        VALUES ($1, $2, $3)
        ON CONFLICT (uuid, uri) DO UPDATE SET
            permissions = EXCLUDED.permissions
        "#,
    )
    .bind(uuid)
    .bind(uri)
    .bind(permissions)
    .execute(conn)
    .await?;
    Ok(())
}

/// Snapshot the resulting ACL state into the audit trail.
pub async fn insert_acl_audit(
    conn: &mut PgConnection,
    uuid: Uuid,
    updated: DateTime<Utc>,
    updater_uri: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO acl_audit (uuid, updated, updater_uri, state)
        SELECT $1, $2, $3, COALESCE(
            jsonb_agg(jsonb_build_object('uri', l.uri, 'permissions', l.permissions)
                      ORDER BY l.uri),
            '[]'::jsonb
        )
        FROM (
            SELECT uri, permissions FROM acl WHERE uuid = $1
        ) AS l
        "#,
    )
    .bind(uuid)
    .bind(updated)
    .bind(updater_uri)
    .execute(conn)
    .await?;
    Ok(())
}

/// `None` when the document does not exist; otherwise whether any of
/// the grantee URIs holds the permission.
pub async fn check_permission(
    pool: &PgPool,
    uuid: Uuid,
    grantee_uris: &[String],
    permission: &str,
) -> sqlx::Result<Option<bool>> {
    sqlx::query_scalar::<_, bool>(
        "SELECT (acl.uri IS NOT NULL) AS has_access \
         FROM document AS d \
              LEFT JOIN acl \
                   ON acl.uuid = d.uuid AND acl.uri = ANY($2::text[]) \
                   AND $3::text = ANY(acl.permissions) \
         WHERE d.uuid = $1 \
         LIMIT 1",
    )
    .bind(uuid)
    .bind(grantee_uris)
    .bind(permission)
    .fetch_optional(pool)
    .await
}

// ════════════════════════════════════════════════════════════════
// Delete lifecycle
// ════════════════════════════════════════════════════════════════

#[allow(clippy::too_many_arguments)]
pub async fn insert_delete_record(
    conn: &mut PgConnection,
    uuid: Uuid,
    uri: &str,
    doc_type: &str,
    version: i64,
    created: DateTime<Utc>,
    creator_uri: &str,
    meta: Option<&serde_json::Value>,
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO delete_record ( \
             uuid, uri, type, version, created, creator_uri, meta \
         ) VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING id",
    )
    .bind(uuid)
    .bind(uri)
    .bind(doc_type)
    .bind(version)
    .bind(created)
    .bind(creator_uri)
    .bind(meta)
    .fetch_one(conn)
    .await
}

pub async fn mark_document_deleting(
    conn: &mut PgConnection,
    uuid: Uuid,
    updated: DateTime<Utc>,
    updater_uri: &str,
    delete_record_id: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE document \
         SET deleting = true, updated = $2, updater_uri = $3, delete_record_id = $4 \
         WHERE uuid = $1",
    )
    .bind(uuid)
    .bind(updated)
    .bind(updater_uri)
    .bind(delete_record_id)
    .execute(conn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentForDeletion {
    pub uuid: Uuid,
    pub delete_record_id: Option<i64>,
}

/// Claim the oldest document marked deleting. SKIP LOCKED keeps
/// concurrent deleter instances off each other's claims.
pub async fn get_document_for_deletion(
    conn: &mut PgConnection,
) -> sqlx::Result<Option<DocumentForDeletion>> {
    sqlx::query_as::<_, DocumentForDeletion>(
        "SELECT uuid, delete_record_id FROM document \
         WHERE deleting = true \
         ORDER BY created \
         FOR UPDATE SKIP LOCKED \
         LIMIT 1",
    )
    .fetch_optional(conn)
    .await
}

pub async fn get_document_unarchived_count(
    conn: &mut PgConnection,
    uuid: Uuid,
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(( \
             SELECT COUNT(*) FROM document_status AS s \
             WHERE s.uuid = $1 AND s.archived = false \
         ) + ( \
             SELECT COUNT(*) FROM document_version AS v \
             WHERE v.uuid = $1 AND v.archived = false \
         ), 0)",
    )
    .bind(uuid)
    .fetch_one(conn)
    .await
}

pub async fn finalise_delete(conn: &mut PgConnection, uuid: Uuid) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM document WHERE uuid = $1 AND deleting = true")
        .bind(uuid)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

// ════════════════════════════════════════════════════════════════
// Archiver claims and marks
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VersionForArchiving {
    pub uuid: Uuid,
    pub version: i64,
    pub created: DateTime<Utc>,
    pub creator_uri: String,
    pub meta: Option<serde_json::Value>,
    pub document_data: Option<serde_json::Value>,
    pub parent_signature: Option<String>,
}

/// Next version whose parent (if any) is already archived, oldest
/// first.
pub async fn get_version_for_archiving(
    conn: &mut PgConnection,
) -> sqlx::Result<Option<VersionForArchiving>> {
    sqlx::query_as::<_, VersionForArchiving>(
        "SELECT v.uuid, v.version, v.created, v.creator_uri, v.meta, \
                v.document_data, p.signature AS parent_signature \
         FROM document_version AS v \
              LEFT JOIN document_version AS p \
                   ON p.uuid = v.uuid AND p.version = v.version - 1 \
         WHERE v.archived = false \
         AND (v.version = 1 OR p.archived = true) \
         ORDER BY v.created \
         FOR UPDATE OF v SKIP LOCKED \
         LIMIT 1",
    )
    .fetch_optional(conn)
    .await
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatusForArchiving {
    pub uuid: Uuid,
    pub name: String,
    pub id: i64,
    pub version: i64,
    pub created: DateTime<Utc>,
    pub creator_uri: String,
    pub meta: Option<serde_json::Value>,
    pub parent_signature: Option<String>,
    pub version_signature: Option<String>,
}

/// Next status whose chain parent is archived and whose pinned
/// version has been signed already.
pub async fn get_status_for_archiving(
    conn: &mut PgConnection,
) -> sqlx::Result<Option<StatusForArchiving>> {
    sqlx::query_as::<_, StatusForArchiving>(
        "SELECT s.uuid, s.name, s.id, s.version, s.created, s.creator_uri, s.meta, \
                p.signature AS parent_signature, v.signature AS version_signature \
         FROM document_status AS s \
              INNER JOIN document_version AS v \
                    ON v.uuid = s.uuid \
                       AND v.version = s.version \
                       AND v.signature IS NOT NULL \
              LEFT JOIN document_status AS p \
                   ON p.uuid = s.uuid AND p.name = s.name AND p.id = s.id - 1 \
         WHERE s.archived = false \
         AND (s.id = 1 OR p.archived = true) \
         ORDER BY s.created \
         FOR UPDATE OF s SKIP LOCKED \
         LIMIT 1",
    )
    .fetch_optional(conn)
    .await
}

pub async fn set_version_archived(
    conn: &mut PgConnection,
    uuid: Uuid,
    version: i64,
    signature: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE document_version \
         SET archived = true, signature = $1 \
         WHERE uuid = $2 AND version = $3",
    )
    .bind(signature)
    .bind(uuid)
    .bind(version)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn set_status_archived(
    conn: &mut PgConnection,
    uuid: Uuid,
    name: &str,
    id: i64,
    signature: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE document_status \
         SET archived = true, signature = $1 \
         WHERE uuid = $2 AND name = $3 AND id = $4",
    )
    .bind(signature)
    .bind(uuid)
    .bind(name)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Unarchived records across all documents; used for stall reporting.
pub async fn count_unarchived_total(pool: &PgPool) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(( \
             SELECT COUNT(*) FROM document_version WHERE archived = false \
         ) + ( \
             SELECT COUNT(*) FROM document_status WHERE archived = false \
         ), 0)",
    )
    .fetch_one(pool)
    .await
}

// ════════════════════════════════════════════════════════════════
// Signing keys, schemas, notification
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SigningKeyRow {
    pub kid: String,
    pub spec: serde_json::Value,
}

pub async fn get_signing_keys(conn: &mut PgConnection) -> sqlx::Result<Vec<SigningKeyRow>> {
    sqlx::query_as::<_, SigningKeyRow>("SELECT kid, spec FROM signing_key ORDER BY kid")
        .fetch_all(conn)
        .await
}

pub async fn insert_signing_key(
    conn: &mut PgConnection,
    kid: &str,
    spec: &serde_json::Value,
) -> sqlx::Result<()> {
    sqlx::query("INSERT INTO signing_key (kid, spec) VALUES ($1, $2)")
        .bind(kid)
        .bind(spec)
        .execute(conn)
        .await?;
    Ok(())
}

/// Transaction-scoped advisory lock; released on commit or rollback.
pub async fn acquire_tx_lock(conn: &mut PgConnection, id: i64) -> sqlx::Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1::bigint)")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn register_schema(
    conn: &mut PgConnection,
    name: &str,
    version: &str,
    spec: &serde_json::Value,
) -> sqlx::Result<()> {
    sqlx::query("INSERT INTO document_schema (name, version, spec) VALUES ($1, $2, $3)")
        .bind(name)
        .bind(version)
        .bind(spec)
        .execute(conn)
        .await?;
    Ok(())
}

/// Activate a schema version. Re-activating the current version
/// affects no rows, which callers use to skip the notification.
pub async fn activate_schema(
    conn: &mut PgConnection,
    name: &str,
    version: &str,
) -> sqlx::Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO active_schema (name, version)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE SET version = EXCLUDED.version
        WHERE active_schema.version <> EXCLUDED.version
        "#,
    )
    .bind(name)
    .bind(version)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

pub async fn deactivate_schema(conn: &mut PgConnection, name: &str) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM active_schema WHERE name = $1")
        .bind(name)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SchemaRow {
    pub name: String,
    pub version: String,
    pub spec: serde_json::Value,
}

pub async fn get_active_schema(pool: &PgPool, name: &str) -> sqlx::Result<Option<SchemaRow>> {
    sqlx::query_as::<_, SchemaRow>(
        "SELECT s.name, s.version, s.spec \
         FROM active_schema AS a \
              INNER JOIN document_schema AS s \
                    ON s.name = a.name AND s.version = a.version \
         WHERE a.name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
}

pub async fn get_schema(
    pool: &PgPool,
    name: &str,
    version: &str,
) -> sqlx::Result<Option<SchemaRow>> {
    sqlx::query_as::<_, SchemaRow>(
        "SELECT name, version, spec FROM document_schema \
         WHERE name = $1 AND version = $2",
    )
    .bind(name)
    .bind(version)
    .fetch_optional(pool)
    .await
}

pub async fn get_active_schemas(pool: &PgPool) -> sqlx::Result<Vec<SchemaRow>> {
    sqlx::query_as::<_, SchemaRow>(
        "SELECT s.name, s.version, s.spec \
         FROM active_schema AS a \
              INNER JOIN document_schema AS s \
                    ON s.name = a.name AND s.version = a.version \
         ORDER BY s.name",
    )
    .fetch_all(pool)
    .await
}

/// NOTIFY inside the caller's transaction; delivery happens on
/// commit.
pub async fn notify(conn: &mut PgConnection, channel: &str, payload: &str) -> sqlx::Result<()> {
    sqlx::query("SELECT pg_notify($1::text, $2::text)")
        .bind(channel)
        .bind(payload)
        .execute(conn)
        .await?;
    Ok(())
}
