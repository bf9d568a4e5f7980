//! src/services/coordinator.rs
//!
//! UploadCoordinator owns the lifecycle of upload sessions (placeholder creation,
//! provider reservation, part destinations, acknowledgements, finalize and cancel).
//! Every mutating call holds the session's write lock for its whole
//! read-modify-write, so two reports for the same session never interleave.

use super::{locks::SessionLocks, metadata_store::MetadataStore};
use crate::{
    errors::{UploadError, UploadResult},
    models::{
        MAX_PARTS, MediaResource, PartRecord, ResourceMetadata, SessionState, SessionStatus,
        UploadSession, Variant, plan_parts,
    },
    providers::{CompletedPart, ProviderError, SharedAdapter, signed_part::parse_etag},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Session operations the chunk transfer client drives.
#[async_trait]
pub trait SessionCoordinator: Send + Sync {
    /// Load a live session.
    async fn session(&self, session_id: Uuid) -> UploadResult<UploadSession>;

    /// Fresh destination for one part of a signed-part session.
    async fn reissue_destination(&self, session_id: Uuid, part_number: u32)
    -> UploadResult<String>;

    /// Record the provider's completion token for a part.
    async fn report_part_complete(
        &self,
        session_id: Uuid,
        part_number: u32,
        completion_token: &str,
    ) -> UploadResult<SessionState>;

    /// Record a provider-confirmed offset; returns the offset now stored.
    async fn report_offset(&self, session_id: Uuid, offset: u64) -> UploadResult<u64>;

    /// Assemble the upload and attach the provider object to the placeholder.
    async fn finalize(&self, session_id: Uuid) -> UploadResult<String>;

    /// Drop the session and its placeholder without contacting the provider.
    async fn cancel_session(&self, session_id: Uuid) -> UploadResult<()>;
}

pub struct UploadCoordinator {
    store: MetadataStore,
    adapter: SharedAdapter,
    session_timeout: Duration,
    locks: SessionLocks,
}

impl UploadCoordinator {
    pub fn new(store: MetadataStore, adapter: SharedAdapter, session_timeout: Duration) -> Self {
        Self {
            store,
            adapter,
            session_timeout,
            locks: SessionLocks::new(),
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn variant(&self) -> Variant {
        self.adapter.variant()
    }

    /// Validate, reserve at the provider, then persist the placeholder, session and
    /// parts together. Nothing is written when validation or reservation fails.
    pub async fn create_session(
        &self,
        total_bytes: u64,
        metadata: ResourceMetadata,
    ) -> UploadResult<UploadSession> {
        if total_bytes == 0 {
            return Err(UploadError::invalid("totalBytes must be greater than zero"));
        }
        if metadata.name.trim().is_empty() {
            return Err(UploadError::invalid("name must not be empty"));
        }
        let chunk_size = self.adapter.chunk_size();
        if chunk_size == 0 {
            return Err(UploadError::invalid("provider chunk size must be greater than zero"));
        }
        let variant = self.adapter.variant();
        let needed = total_bytes.div_ceil(chunk_size);
        let limit = match variant {
            Variant::SignedPart => MAX_PARTS,
            Variant::OffsetResumable => u64::from(u32::MAX),
        };
        if needed > limit {
            return Err(UploadError::invalid(format!(
                "totalBytes {total_bytes} needs {needed} chunks of {chunk_size} bytes; the limit is {limit}"
            )));
        }
        let part_count = u32::try_from(needed)
            .map_err(|_| UploadError::invalid(format!("{needed} chunks exceed the part limit")))?;

        let reservation = self
            .adapter
            .reserve(total_bytes, part_count, &metadata)
            .await
            .map_err(|err| UploadError::ProviderUnavailable(err.to_string()))?;

        let parts = match variant {
            Variant::SignedPart => {
                let plan = plan_parts(total_bytes, chunk_size);
                let issued: Vec<u32> = reservation.part_urls.iter().map(|(n, _)| *n).collect();
                if !plan.iter().map(|p| p.part_number).eq(issued.iter().copied()) {
                    return Err(UploadError::ProviderUnavailable(format!(
                        "provider issued {} part URLs for {} parts",
                        issued.len(),
                        plan.len()
                    )));
                }
                reservation
                    .part_urls
                    .into_iter()
                    .map(|(part_number, destination_url)| PartRecord {
                        part_number,
                        destination_url,
                        completion_token: None,
                    })
                    .collect()
            }
            Variant::OffsetResumable => Vec::new(),
        };

        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.session_timeout)
                .map_err(|err| UploadError::invalid(format!("session timeout: {err}")))?;
        let session = UploadSession {
            id: Uuid::new_v4(),
            total_bytes,
            chunk_size,
            state: SessionState::Reserved,
            handle: reservation.handle,
            parts,
            committed_offset: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            expires_at,
        };
        let resource = MediaResource {
            id: session.id,
            name: metadata.name.trim().to_string(),
            provider_object_ref: None,
            created_at: now,
            modified_at: now,
        };

        self.store.create_session(&session, &resource).await?;
        info!(
            session_id = %session.id,
            variant = %session.variant(),
            total_bytes,
            chunk_size,
            parts = session.parts.len(),
            "upload session reserved"
        );
        Ok(session)
    }

    /// Status of a session, or of the resource it collapsed into after finalize.
    pub async fn poll(&self, session_id: Uuid) -> UploadResult<SessionStatus> {
        if let Some(session) = self.store.find_session(session_id).await? {
            return Ok(SessionStatus::of(&session));
        }
        match self.store.find_resource(session_id).await? {
            Some(MediaResource {
                provider_object_ref: Some(object_ref),
                ..
            }) => Ok(SessionStatus::completed(session_id, object_ref)),
            _ => Err(UploadError::SessionNotFound(session_id)),
        }
    }

    pub async fn resource(&self, id: Uuid) -> UploadResult<Option<MediaResource>> {
        self.store.find_resource(id).await
    }

    /// Cancel every session whose expiry has passed. Returns the ids removed.
    pub async fn expire_stale_sessions(&self, now: DateTime<Utc>) -> UploadResult<Vec<Uuid>> {
        let mut expired = Vec::new();
        for id in self.store.expired_session_ids(now).await? {
            let _guard = self.locks.acquire(id).await;
            if self.store.delete_session(id).await? {
                warn!(session_id = %id, "upload session expired; placeholder removed");
                expired.push(id);
            }
        }
        Ok(expired)
    }

    /// Load a session for mutation. An expired session is removed on sight.
    async fn load_live(&self, session_id: Uuid) -> UploadResult<UploadSession> {
        let session = self.store.get_session(session_id).await?;
        if session.is_expired(Utc::now()) {
            self.store.delete_session(session_id).await?;
            warn!(%session_id, "upload session expired; placeholder removed");
            return Err(UploadError::SessionExpired(session_id));
        }
        Ok(session)
    }

    async fn transition(
        &self,
        session: &UploadSession,
        next: SessionState,
        last_error: Option<&str>,
    ) -> UploadResult<()> {
        if session.state == next && last_error == session.last_error.as_deref() {
            return Ok(());
        }
        if session.state != next && !session.state.can_transition_to(next) {
            return Err(invalid_transition(session, next));
        }
        self.store.set_state(session.id, next, last_error).await?;
        if session.state != next {
            info!(session_id = %session.id, from = %session.state, to = %next, "session state changed");
        }
        Ok(())
    }

    fn require_variant(session: &UploadSession, variant: Variant) -> UploadResult<()> {
        if session.variant() != variant {
            return Err(UploadError::invalid(format!(
                "session `{}` is {}, not {variant}",
                session.id,
                session.variant()
            )));
        }
        Ok(())
    }

    fn require_part(session: &UploadSession, part_number: u32) -> UploadResult<()> {
        if session.part_range(part_number).is_none() {
            return Err(UploadError::PartOutOfRange {
                session_id: session.id,
                part_number,
                part_count: session.part_count(),
            });
        }
        Ok(())
    }

    fn acked_state(session: &UploadSession) -> SessionState {
        if session.is_fully_acknowledged() {
            SessionState::AllPartsAcked
        } else {
            SessionState::Uploading
        }
    }
}

fn invalid_transition(session: &UploadSession, next: SessionState) -> UploadError {
    UploadError::InvalidTransition {
        session_id: session.id,
        from: session.state.to_string(),
        to: next.to_string(),
    }
}

fn incomplete_detail(session: &UploadSession) -> String {
    match session.variant() {
        Variant::SignedPart => format!("missing parts {:?}", session.missing_parts()),
        Variant::OffsetResumable => format!(
            "{} of {} bytes acknowledged",
            session.committed_offset, session.total_bytes
        ),
    }
}

#[async_trait]
impl SessionCoordinator for UploadCoordinator {
    async fn session(&self, session_id: Uuid) -> UploadResult<UploadSession> {
        self.load_live(session_id).await
    }

    async fn reissue_destination(
        &self,
        session_id: Uuid,
        part_number: u32,
    ) -> UploadResult<String> {
        let _guard = self.locks.acquire(session_id).await;
        let session = self.load_live(session_id).await?;
        Self::require_variant(&session, Variant::SignedPart)?;
        Self::require_part(&session, part_number)?;
        if !session.state.can_transition_to(SessionState::Uploading) {
            return Err(invalid_transition(&session, SessionState::Uploading));
        }

        let url = self
            .adapter
            .reissue_part(&session.handle, part_number)
            .await
            .map_err(|err| UploadError::ProviderUnavailable(err.to_string()))?;

        self.store
            .set_part_destination(session_id, part_number, &url)
            .await?;
        self.transition(&session, SessionState::Uploading, None).await?;
        info!(%session_id, part_number, "part destination reissued");
        Ok(url)
    }

    async fn report_part_complete(
        &self,
        session_id: Uuid,
        part_number: u32,
        completion_token: &str,
    ) -> UploadResult<SessionState> {
        let token = parse_etag(completion_token)
            .ok_or_else(|| UploadError::invalid("completion token must not be empty"))?;

        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.load_live(session_id).await?;
        Self::require_variant(&session, Variant::SignedPart)?;
        Self::require_part(&session, part_number)?;

        let unchanged = session
            .part(part_number)
            .and_then(|p| p.completion_token.as_deref())
            == Some(token.as_str());
        if unchanged {
            debug!(%session_id, part_number, "duplicate part report ignored");
            return Ok(session.state);
        }
        if session.state == SessionState::Finalizing {
            return Err(invalid_transition(&session, SessionState::Uploading));
        }

        self.store
            .set_part_token(session_id, part_number, &token)
            .await?;
        if let Some(part) = session.part_mut(part_number) {
            part.completion_token = Some(token);
        }

        let next = Self::acked_state(&session);
        self.transition(&session, next, None).await?;
        debug!(
            %session_id,
            part_number,
            acknowledged = session.acknowledged_parts(),
            parts = session.parts.len(),
            "part acknowledged"
        );
        Ok(next)
    }

    async fn report_offset(&self, session_id: Uuid, offset: u64) -> UploadResult<u64> {
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.load_live(session_id).await?;
        Self::require_variant(&session, Variant::OffsetResumable)?;
        if offset > session.total_bytes {
            return Err(UploadError::invalid(format!(
                "offset {offset} exceeds declared size {}",
                session.total_bytes
            )));
        }
        if offset <= session.committed_offset {
            return Ok(session.committed_offset);
        }
        if session.state == SessionState::Finalizing {
            return Err(invalid_transition(&session, SessionState::Uploading));
        }

        let stored = self.store.advance_offset(session_id, offset).await?;
        session.committed_offset = stored;

        let next = Self::acked_state(&session);
        self.transition(&session, next, None).await?;
        debug!(%session_id, offset = stored, total_bytes = session.total_bytes, "offset confirmed");
        Ok(stored)
    }

    async fn finalize(&self, session_id: Uuid) -> UploadResult<String> {
        let _guard = self.locks.acquire(session_id).await;
        let session = self.load_live(session_id).await?;

        if !session.is_fully_acknowledged() {
            return Err(UploadError::IncompleteUpload {
                session_id,
                detail: incomplete_detail(&session),
            });
        }
        if !matches!(
            session.state,
            SessionState::AllPartsAcked | SessionState::Failed | SessionState::Finalizing
        ) {
            return Err(invalid_transition(&session, SessionState::Finalizing));
        }

        self.transition(&session, SessionState::Finalizing, None)
            .await?;

        let object_ref = match self.store.assembled_ref(session_id).await? {
            Some(object_ref) => {
                info!(
                    %session_id,
                    provider_object_ref = %object_ref,
                    "attaching previously assembled object"
                );
                object_ref
            }
            None => {
                let parts: Vec<CompletedPart> = session
                    .parts
                    .iter()
                    .filter_map(|p| {
                        p.completion_token.as_ref().map(|etag| CompletedPart {
                            part_number: p.part_number,
                            etag: etag.clone(),
                        })
                    })
                    .collect();

                match self.adapter.finalize(&session.handle, &parts).await {
                    Ok(object_ref) => object_ref,
                    Err(err) => {
                        let reason = err.to_string();
                        self.store
                            .set_state(session_id, SessionState::Failed, Some(&reason))
                            .await?;
                        warn!(%session_id, error = %reason, "finalize failed; session kept for retry");
                        return Err(if err.is_transient() {
                            UploadError::ProviderUnavailable(reason)
                        } else {
                            UploadError::ProviderRejected { session_id, reason }
                        });
                    }
                }
            }
        };

        match self.store.complete_session(session_id, &object_ref).await {
            Ok(resource) => {
                info!(
                    %session_id,
                    provider_object_ref = %object_ref,
                    name = %resource.name,
                    "upload finalized"
                );
                Ok(object_ref)
            }
            Err(err) => {
                // The provider object exists now; keep its reference so a retry only
                // has to attach it.
                error!(
                    %session_id,
                    provider_object_ref = %object_ref,
                    error = %err,
                    "provider assembled the upload but recording it failed"
                );
                if let Err(record_err) = self
                    .store
                    .record_assembled(session_id, &object_ref, &err.to_string())
                    .await
                {
                    error!(
                        %session_id,
                        provider_object_ref = %object_ref,
                        error = %record_err,
                        "could not keep the assembled object reference"
                    );
                }
                Err(err)
            }
        }
    }

    async fn cancel_session(&self, session_id: Uuid) -> UploadResult<()> {
        let _guard = self.locks.acquire(session_id).await;
        if !self.store.delete_session(session_id).await? {
            return Err(UploadError::SessionNotFound(session_id));
        }
        info!(%session_id, "upload session cancelled");
        Ok(())
    }
}
