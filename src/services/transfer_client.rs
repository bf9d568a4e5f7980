//! Chunk transfer client: drives one session from a local file to the provider, one
//! chunk at a time, strictly in increasing order.
//!
//! Failure handling differs by variant. A failed signed part gets a fresh destination
//! from the coordinator and is re-sent in full. A failed offset-resumable PATCH is
//! replayed from the last offset the provider confirmed; local progress only ever
//! moves to a value the provider reported.

use super::{coordinator::SessionCoordinator, retry::RetryPolicy};
use crate::{
    errors::{UploadError, UploadResult},
    models::{ChunkSpec, Progress, ProviderHandle, SessionState, UploadSession, Variant},
    providers::{ChunkAck, ProviderError, SharedAdapter},
};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt},
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ChunkTransferClient {
    coordinator: Arc<dyn SessionCoordinator>,
    adapter: SharedAdapter,
    policy: RetryPolicy,
}

/// Outcome of one attempt that did not move the session forward.
struct FailedAttempt {
    error: UploadError,
}

impl FailedAttempt {
    fn transient(session_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            error: UploadError::TransientNetwork {
                session_id,
                reason: reason.into(),
            },
        }
    }

    fn from_provider(session_id: Uuid, part_number: Option<u32>, err: ProviderError) -> Self {
        let error = match (err, part_number) {
            (ProviderError::DestinationExpired(reason), Some(part_number)) => {
                UploadError::DestinationExpired {
                    session_id,
                    part_number,
                    reason,
                }
            }
            (err, _) => UploadError::TransientNetwork {
                session_id,
                reason: err.to_string(),
            },
        };
        Self { error }
    }
}

impl ChunkTransferClient {
    pub fn new(
        coordinator: Arc<dyn SessionCoordinator>,
        adapter: SharedAdapter,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            coordinator,
            adapter,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Apply exactly the next chunk of `session`. `body` must be the bytes of that
    /// chunk. On return `session` reflects what the provider acknowledged. `cancel`
    /// interrupts the backoff between attempts.
    pub async fn upload_chunk(
        &self,
        session: &mut UploadSession,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> UploadResult<Progress> {
        let chunk = session.next_chunk().ok_or_else(|| {
            UploadError::invalid(format!("session `{}` has no chunk left to send", session.id))
        })?;
        if body.len() as u64 != chunk.len {
            return Err(UploadError::invalid(format!(
                "chunk at offset {} must be {} bytes, got {}",
                chunk.offset,
                chunk.len,
                body.len()
            )));
        }

        match session.variant() {
            Variant::SignedPart => self.send_part(session, chunk, body, cancel).await?,
            Variant::OffsetResumable => self.send_range(session, chunk, body, cancel).await?,
        }
        Ok(session.progress())
    }

    /// Upload the whole source, then finalize. Cancellation and the session deadline
    /// are checked between chunks and during backoff; a request already in flight is
    /// allowed to finish. Either ends the session.
    pub async fn upload_file<R>(
        &self,
        session_id: Uuid,
        source: &mut R,
        cancel: &CancellationToken,
    ) -> UploadResult<String>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let mut session = self.coordinator.session(session_id).await?;
        let source_len = source.seek(std::io::SeekFrom::End(0)).await?;
        if source_len != session.total_bytes {
            return Err(UploadError::invalid(format!(
                "source has {source_len} bytes but the session declares {}",
                session.total_bytes
            )));
        }
        let deadline = Instant::now() + self.policy.session_timeout;

        while let Some(chunk) = session.next_chunk() {
            if cancel.is_cancelled() {
                return Err(self.abandon(session_id, UploadError::Cancelled(session_id)).await);
            }
            if Instant::now() >= deadline || session.is_expired(Utc::now()) {
                return Err(self
                    .abandon(session_id, UploadError::SessionExpired(session_id))
                    .await);
            }

            let body = read_range(source, chunk).await?;
            match self.upload_chunk(&mut session, body, cancel).await {
                Ok(progress) => info!(
                    %session_id,
                    completed = progress.completed,
                    total = progress.total,
                    fraction = progress.fraction(),
                    "upload progress"
                ),
                Err(err @ UploadError::Cancelled(_)) => {
                    return Err(self.abandon(session_id, err).await);
                }
                Err(err) => return Err(err),
            }
        }

        self.coordinator.finalize(session_id).await
    }

    /// Cancel the session, keeping `reason` as the error reported to the caller.
    async fn abandon(&self, session_id: Uuid, reason: UploadError) -> UploadError {
        match self.coordinator.cancel_session(session_id).await {
            Ok(()) | Err(UploadError::SessionNotFound(_)) => reason,
            Err(err) => err,
        }
    }

    async fn send_part(
        &self,
        session: &mut UploadSession,
        chunk: ChunkSpec,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> UploadResult<()> {
        let session_id = session.id;
        let part_number = chunk.part_number.ok_or_else(|| {
            UploadError::invalid(format!("session `{session_id}` has no part at {}", chunk.offset))
        })?;
        let mut destination = session
            .part(part_number)
            .map(|p| p.destination_url.clone())
            .ok_or(UploadError::PartOutOfRange {
                session_id,
                part_number,
                part_count: session.part_count(),
            })?;
        let mut attempts = 0u32;
        let mut needs_reissue = false;

        loop {
            let failure = if needs_reissue {
                match self
                    .coordinator
                    .reissue_destination(session_id, part_number)
                    .await
                {
                    Ok(url) => {
                        if let Some(part) = session.part_mut(part_number) {
                            part.destination_url = url.clone();
                            part.completion_token = None;
                        }
                        destination = url;
                        needs_reissue = false;
                        continue;
                    }
                    Err(UploadError::ProviderUnavailable(reason)) => {
                        FailedAttempt::transient(session_id, reason)
                    }
                    Err(err) => return Err(err),
                }
            } else {
                match self.attempt(&destination, chunk.offset, body.clone()).await {
                    Ok(ChunkAck::Token(token)) => {
                        let state = self
                            .coordinator
                            .report_part_complete(session_id, part_number, &token)
                            .await?;
                        if let Some(part) = session.part_mut(part_number) {
                            part.completion_token = Some(token);
                        }
                        session.state = state;
                        debug!(%session_id, part_number, attempts = attempts + 1, "part uploaded");
                        return Ok(());
                    }
                    Ok(ChunkAck::Offset(_)) => FailedAttempt::transient(
                        session_id,
                        "part upload acknowledged with an offset",
                    ),
                    Err(err) => FailedAttempt::from_provider(session_id, Some(part_number), err),
                }
            };

            attempts += 1;
            warn!(
                %session_id,
                part_number,
                attempt = attempts,
                error = %failure.error,
                "part attempt failed"
            );
            if !self.policy.allows_another_attempt(attempts) {
                return Err(UploadError::RetriesExhausted {
                    session_id,
                    part_number: Some(part_number),
                    offset: chunk.offset,
                    attempts,
                    last_error: failure.error.to_string(),
                });
            }
            self.back_off(session_id, attempts, cancel).await?;
            needs_reissue = true;
        }
    }

    async fn send_range(
        &self,
        session: &mut UploadSession,
        chunk: ChunkSpec,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> UploadResult<()> {
        let session_id = session.id;
        let upload_url = match &session.handle {
            ProviderHandle::OffsetResumable { upload_url, .. } => {
                upload_url.clone()
            }
            ProviderHandle::SignedPart { .. } => {
                return Err(UploadError::invalid(format!(
                    "session `{session_id}` is not offset-resumable"
                )));
            }
        };
        let mut attempts = 0u32;

        loop {
            let offset = session.committed_offset;
            let failure = match self.attempt(&upload_url, offset, body.clone()).await {
                Ok(ChunkAck::Offset(reported)) if reported > offset => {
                    if reported > session.total_bytes {
                        FailedAttempt::transient(
                            session_id,
                            format!(
                                "provider reported offset {reported} beyond {} bytes",
                                session.total_bytes
                            ),
                        )
                    } else {
                        let stored = self.coordinator.report_offset(session_id, reported).await?;
                        session.committed_offset = stored;
                        session.state = if stored >= session.total_bytes {
                            SessionState::AllPartsAcked
                        } else {
                            SessionState::Uploading
                        };
                        if stored < chunk.offset + chunk.len {
                            debug!(%session_id, offset = stored, "provider accepted a partial chunk");
                        }
                        return Ok(());
                    }
                }
                Ok(ChunkAck::Offset(reported)) => FailedAttempt::transient(
                    session_id,
                    format!("provider offset {reported} did not advance past {offset}"),
                ),
                Ok(ChunkAck::Token(_)) => {
                    FailedAttempt::transient(session_id, "range upload acknowledged with a token")
                }
                Err(err) => FailedAttempt::from_provider(session_id, None, err),
            };

            attempts += 1;
            warn!(
                %session_id,
                offset,
                attempt = attempts,
                error = %failure.error,
                "range attempt failed; replaying from confirmed offset"
            );
            if !self.policy.allows_another_attempt(attempts) {
                return Err(UploadError::RetriesExhausted {
                    session_id,
                    part_number: None,
                    offset,
                    attempts,
                    last_error: failure.error.to_string(),
                });
            }
            self.back_off(session_id, attempts, cancel).await?;
        }
    }

    /// One request, bounded by the per-attempt timeout.
    async fn attempt(
        &self,
        destination: &str,
        offset: u64,
        body: Bytes,
    ) -> Result<ChunkAck, ProviderError> {
        timeout(
            self.policy.attempt_timeout,
            self.adapter.upload_chunk(destination, offset, body),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ProviderError::Transient(format!(
                "no response within {:?}",
                self.policy.attempt_timeout
            )))
        })
    }

    async fn back_off(
        &self,
        session_id: Uuid,
        attempts: u32,
        cancel: &CancellationToken,
    ) -> UploadResult<()> {
        let delay = self.policy.backoff(attempts);
        tokio::select! {
            _ = cancel.cancelled() => Err(UploadError::Cancelled(session_id)),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

async fn read_range<R>(source: &mut R, chunk: ChunkSpec) -> UploadResult<Bytes>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let len = usize::try_from(chunk.len)
        .map_err(|_| UploadError::invalid(format!("chunk of {} bytes is too large", chunk.len)))?;
    let mut buf = vec![0u8; len];
    source.seek(std::io::SeekFrom::Start(chunk.offset)).await?;
    source.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
