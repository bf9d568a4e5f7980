//! src/services/upload_service.rs
//!
//! UploadService: the engine facade shared by the HTTP handlers and the one-shot CLI
//! upload. It owns the coordinator and the transfer client and keeps at most one
//! chunk (or finalize) in flight per session. Transfers register a cancellation
//! token so a cancel interrupts their retry backoff instead of queueing behind it.

use super::{
    coordinator::{SessionCoordinator, UploadCoordinator},
    locks::{CancelRegistry, SessionLocks},
    metadata_store::MetadataStore,
    retry::RetryPolicy,
    transfer_client::ChunkTransferClient,
};
use crate::{
    errors::{UploadError, UploadResult},
    models::{MediaResource, ResourceMetadata, SessionStatus, UploadSession, Variant},
    providers::SharedAdapter,
};
use bytes::Bytes;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{path::Path, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    coordinator: Arc<UploadCoordinator>,
    client: Arc<ChunkTransferClient>,
    in_flight: SessionLocks,
    cancels: CancelRegistry,
}

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, adapter: SharedAdapter, policy: RetryPolicy) -> Self {
        let coordinator = Arc::new(UploadCoordinator::new(
            MetadataStore::new(db.clone()),
            adapter.clone(),
            policy.session_timeout,
        ));
        let client = Arc::new(ChunkTransferClient::new(
            coordinator.clone(),
            adapter,
            policy,
        ));
        Self {
            db,
            coordinator,
            client,
            in_flight: SessionLocks::new(),
            cancels: CancelRegistry::new(),
        }
    }

    pub fn coordinator(&self) -> &UploadCoordinator {
        &self.coordinator
    }

    pub fn variant(&self) -> Variant {
        self.coordinator.variant()
    }

    pub async fn create_session(
        &self,
        total_bytes: u64,
        metadata: ResourceMetadata,
    ) -> UploadResult<UploadSession> {
        self.coordinator.create_session(total_bytes, metadata).await
    }

    pub async fn poll(&self, session_id: Uuid) -> UploadResult<SessionStatus> {
        self.coordinator.poll(session_id).await
    }

    pub async fn resource(&self, id: Uuid) -> UploadResult<Option<MediaResource>> {
        self.coordinator.resource(id).await
    }

    /// Send the next chunk of a session. Concurrent calls for the same session wait
    /// for each other.
    pub async fn upload_chunk(&self, session_id: Uuid, body: Bytes) -> UploadResult<SessionStatus> {
        let _guard = self.in_flight.acquire(session_id).await;
        let running = self.cancels.register(session_id, CancellationToken::new());
        let mut session = self.coordinator.session(session_id).await?;
        self.client
            .upload_chunk(&mut session, body, running.token())
            .await?;
        Ok(SessionStatus::of(&session))
    }

    pub async fn reissue_destination(&self, session_id: Uuid, part_number: u32) -> UploadResult<String> {
        let _guard = self.in_flight.acquire(session_id).await;
        self.coordinator
            .reissue_destination(session_id, part_number)
            .await
    }

    pub async fn report_part_complete(
        &self,
        session_id: Uuid,
        part_number: u32,
        completion_token: &str,
    ) -> UploadResult<()> {
        let _guard = self.in_flight.acquire(session_id).await;
        self.coordinator
            .report_part_complete(session_id, part_number, completion_token)
            .await
            .map(|_| ())
    }

    /// Finalize once every chunk is acknowledged; otherwise report where the session
    /// stands. A session that already completed reports its object reference again.
    pub async fn finalize_or_poll(&self, session_id: Uuid) -> UploadResult<SessionStatus> {
        let _guard = self.in_flight.acquire(session_id).await;
        let Some(session) = self.coordinator.store().find_session(session_id).await? else {
            return self.coordinator.poll(session_id).await;
        };
        if !session.is_fully_acknowledged() {
            return Ok(SessionStatus::of(&session));
        }
        let object_ref = self.coordinator.finalize(session_id).await?;
        Ok(SessionStatus::completed(session_id, object_ref))
    }

    /// Drop a session and its placeholder. A transfer running for it is interrupted
    /// first and has released the session by the time the lock is granted.
    pub async fn cancel_session(&self, session_id: Uuid) -> UploadResult<()> {
        let interrupted = self.cancels.cancel(session_id);
        let _guard = self.in_flight.acquire(session_id).await;
        match self.coordinator.cancel_session(session_id).await {
            // A file transfer abandons its own session when interrupted.
            Err(UploadError::SessionNotFound(_)) if interrupted => Ok(()),
            result => result,
        }
    }

    /// Create a session for a local file and drive it to completion in-process.
    pub async fn upload_file(
        &self,
        path: &Path,
        metadata: ResourceMetadata,
        cancel: &CancellationToken,
    ) -> UploadResult<MediaResource> {
        let mut file = tokio::fs::File::open(path).await?;
        let total_bytes = file.metadata().await?.len();
        let session = self.create_session(total_bytes, metadata).await?;

        let _guard = self.in_flight.acquire(session.id).await;
        let running = self.cancels.register(session.id, cancel.child_token());
        self.client
            .upload_file(session.id, &mut file, running.token())
            .await?;

        self.resource(session.id)
            .await?
            .ok_or(UploadError::SessionNotFound(session.id))
    }

    /// Periodically cancel sessions past their expiry.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                match service.coordinator.expire_stale_sessions(Utc::now()).await {
                    Ok(expired) if !expired.is_empty() => {
                        info!(expired = expired.len(), "expired stale upload sessions");
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "session sweep failed"),
                }
            }
        })
    }
}
