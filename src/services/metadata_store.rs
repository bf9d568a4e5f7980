//! src/services/metadata_store.rs
//!
//! MetadataStore: SQLite persistence for media resources, upload sessions and the
//! per-part bookkeeping of signed-part sessions. The upload engine's only writes to
//! the catalog are "create placeholder" and "attach final provider object"; every
//! other write touches session tables only.

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        MediaResource, PartRecord, ProviderHandle, SessionState, UploadSession, Variant,
    },
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct SessionRow {
    id: Uuid,
    total_bytes: i64,
    chunk_size: i64,
    variant: String,
    state: String,
    committed_offset: i64,
    upload_url: Option<String>,
    provider_upload_id: Option<String>,
    provider_key: Option<String>,
    reserved_object_ref: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct PartRow {
    part_number: i64,
    destination_url: String,
    completion_token: Option<String>,
}

const SESSION_COLUMNS: &str = "id, total_bytes, chunk_size, variant, state, committed_offset, \
     upload_url, provider_upload_id, provider_key, reserved_object_ref, last_error, \
     created_at, updated_at, expires_at";

// Timestamps are stored as UTC RFC 3339 text, which sorts chronologically, so the
// comparison runs on the expires_at index.
const EXPIRED_SESSIONS_SQL: &str =
    "SELECT id FROM upload_sessions WHERE expires_at <= ? ORDER BY expires_at ASC";

fn corrupt(id: Uuid, what: impl std::fmt::Display) -> UploadError {
    UploadError::Database(sqlx::Error::Decode(
        format!("session `{id}` has invalid {what}").into(),
    ))
}

impl SessionRow {
    fn into_session(self, parts: Vec<PartRow>) -> UploadResult<UploadSession> {
        let id = self.id;
        let variant: Variant = self.variant.parse().map_err(|e| corrupt(id, e))?;
        let state: SessionState = self.state.parse().map_err(|e| corrupt(id, e))?;
        let handle = match variant {
            Variant::SignedPart => ProviderHandle::SignedPart {
                upload_id: self
                    .provider_upload_id
                    .ok_or_else(|| corrupt(id, "provider upload id"))?,
                key: self.provider_key.ok_or_else(|| corrupt(id, "provider key"))?,
            },
            Variant::OffsetResumable => ProviderHandle::OffsetResumable {
                upload_url: self.upload_url.ok_or_else(|| corrupt(id, "upload url"))?,
                object_ref: self
                    .reserved_object_ref
                    .ok_or_else(|| corrupt(id, "reserved object ref"))?,
            },
        };

        Ok(UploadSession {
            id,
            total_bytes: self.total_bytes as u64,
            chunk_size: self.chunk_size as u64,
            state,
            handle,
            parts: parts
                .into_iter()
                .map(|p| PartRecord {
                    part_number: p.part_number as u32,
                    destination_url: p.destination_url,
                    completion_token: p.completion_token,
                })
                .collect(),
            committed_offset: self.committed_offset as u64,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        })
    }
}

/// Durable metadata for the upload engine.
#[derive(Clone)]
pub struct MetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert the placeholder resource, the session and its parts in one transaction.
    pub async fn create_session(
        &self,
        session: &UploadSession,
        resource: &MediaResource,
    ) -> UploadResult<()> {
        let (upload_url, upload_id, key, object_ref) = match &session.handle {
            ProviderHandle::SignedPart { upload_id, key } => {
                (None, Some(upload_id.as_str()), Some(key.as_str()), None)
            }
            ProviderHandle::OffsetResumable {
                upload_url,
                object_ref,
            } => (Some(upload_url.as_str()), None, None, Some(object_ref.as_str())),
        };

        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO media_resources (id, name, provider_object_ref, created_at, modified_at)
             VALUES (?, ?, NULL, ?, ?)",
        )
        .bind(resource.id)
        .bind(&resource.name)
        .bind(resource.created_at)
        .bind(resource.modified_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO upload_sessions (
                id, total_bytes, chunk_size, variant, state, committed_offset,
                upload_url, provider_upload_id, provider_key, reserved_object_ref,
                last_error, created_at, updated_at, expires_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(session.id)
        .bind(session.total_bytes as i64)
        .bind(session.chunk_size as i64)
        .bind(session.variant().as_str())
        .bind(session.state.as_str())
        .bind(session.committed_offset as i64)
        .bind(upload_url)
        .bind(upload_id)
        .bind(key)
        .bind(object_ref)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .execute(&mut *tx)
        .await?;

        for part in &session.parts {
            sqlx::query(
                "INSERT INTO upload_parts (session_id, part_number, destination_url, completion_token)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(session.id)
            .bind(i64::from(part.part_number))
            .bind(&part.destination_url)
            .bind(part.completion_token.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(session_id = %session.id, parts = session.parts.len(), "persisted upload session");
        Ok(())
    }

    /// Load a session with its parts ordered by part number.
    pub async fn find_session(&self, id: Uuid) -> UploadResult<Option<UploadSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upload_sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let parts = sqlx::query_as::<_, PartRow>(
            "SELECT part_number, destination_url, completion_token
             FROM upload_parts WHERE session_id = ? ORDER BY part_number ASC",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?;

        row.into_session(parts).map(Some)
    }

    /// Like [`find_session`](Self::find_session) but missing rows are an error.
    pub async fn get_session(&self, id: Uuid) -> UploadResult<UploadSession> {
        self.find_session(id)
            .await?
            .ok_or(UploadError::SessionNotFound(id))
    }

    /// Replace a part's destination. A reissued part is a full replace of its byte
    /// range, so any previous completion token is cleared.
    pub async fn set_part_destination(
        &self,
        id: Uuid,
        part_number: u32,
        destination_url: &str,
    ) -> UploadResult<()> {
        let result = sqlx::query(
            "UPDATE upload_parts SET destination_url = ?, completion_token = NULL
             WHERE session_id = ? AND part_number = ?",
        )
        .bind(destination_url)
        .bind(id)
        .bind(i64::from(part_number))
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::SessionNotFound(id));
        }
        self.touch(id).await
    }

    /// Record a part's completion token. Returns false when the same token was
    /// already stored (nothing written).
    pub async fn set_part_token(
        &self,
        id: Uuid,
        part_number: u32,
        token: &str,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_parts SET completion_token = ?
             WHERE session_id = ? AND part_number = ?
               AND (completion_token IS NULL OR completion_token <> ?)",
        )
        .bind(token)
        .bind(id)
        .bind(i64::from(part_number))
        .bind(token)
        .execute(&*self.db)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            self.touch(id).await?;
        }
        Ok(changed)
    }

    /// Move the committed offset forward to `offset`. The stored value never
    /// regresses; the value actually stored is returned.
    pub async fn advance_offset(&self, id: Uuid, offset: u64) -> UploadResult<u64> {
        let stored = sqlx::query_scalar::<_, i64>(
            "UPDATE upload_sessions
             SET committed_offset = MAX(committed_offset, ?), updated_at = ?
             WHERE id = ?
             RETURNING committed_offset",
        )
        .bind(offset as i64)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        stored
            .map(|v| v as u64)
            .ok_or(UploadError::SessionNotFound(id))
    }

    pub async fn set_state(
        &self,
        id: Uuid,
        state: SessionState,
        last_error: Option<&str>,
    ) -> UploadResult<()> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET state = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(last_error)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::SessionNotFound(id));
        }
        Ok(())
    }

    /// Attach the provider object to the placeholder and drop the session
    /// bookkeeping, atomically.
    pub async fn complete_session(
        &self,
        id: Uuid,
        provider_object_ref: &str,
    ) -> UploadResult<MediaResource> {
        let mut tx = self.db.begin().await?;

        let resource = sqlx::query_as::<_, MediaResource>(
            "UPDATE media_resources SET provider_object_ref = ?, modified_at = ?
             WHERE id = ? AND provider_object_ref IS NULL
             RETURNING id, name, provider_object_ref, created_at, modified_at",
        )
        .bind(provider_object_ref)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(UploadError::SessionNotFound(id))?;

        sqlx::query("DELETE FROM upload_parts WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(resource)
    }

    /// Delete a session and its placeholder row. A resource that already carries a
    /// provider object is never removed. Returns false when no session existed.
    pub async fn delete_session(&self, id: Uuid) -> UploadResult<bool> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM upload_parts WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if removed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM media_resources WHERE id = ? AND provider_object_ref IS NULL")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn find_resource(&self, id: Uuid) -> UploadResult<Option<MediaResource>> {
        let resource = sqlx::query_as::<_, MediaResource>(
            "SELECT id, name, provider_object_ref, created_at, modified_at
             FROM media_resources WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(resource)
    }

    /// Ids of sessions whose expiry is at or before `now`, oldest first.
    pub async fn expired_session_ids(&self, now: DateTime<Utc>) -> UploadResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(EXPIRED_SESSIONS_SQL)
            .bind(now)
            .fetch_all(&*self.db)
            .await?;
        Ok(ids)
    }

    /// Keep the object the provider assembled for a session whose catalog update
    /// failed. The session is marked failed so finalize can be retried, and the retry
    /// attaches this object instead of assembling again.
    pub async fn record_assembled(
        &self,
        id: Uuid,
        object_ref: &str,
        reason: &str,
    ) -> UploadResult<()> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET assembled_ref = ?, state = ?, last_error = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(object_ref)
        .bind(SessionState::Failed.as_str())
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::SessionNotFound(id));
        }
        Ok(())
    }

    pub async fn assembled_ref(&self, id: Uuid) -> UploadResult<Option<String>> {
        let stored = sqlx::query_scalar::<_, Option<String>>(
            "SELECT assembled_ref FROM upload_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(stored.flatten())
    }

    async fn touch(&self, id: Uuid) -> UploadResult<()> {
        sqlx::query("UPDATE upload_sessions SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}
