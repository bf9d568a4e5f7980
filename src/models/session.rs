//! Upload sessions: the local record of one in-flight transfer.
//!
//! A session is created by the coordinator before any bytes move and shares its id
//! with the placeholder [`MediaResource`](super::resource::MediaResource) row. It is
//! deleted once finalize succeeds or the user cancels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Which upload protocol a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// One pre-signed URL per part, an ETag per acknowledged part, explicit finalize.
    SignedPart,
    /// Successive PATCHes to one URL, the provider reports the next expected offset.
    OffsetResumable,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::SignedPart => "signed-part",
            Variant::OffsetResumable => "offset-resumable",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signed-part" | "signed_part" => Ok(Variant::SignedPart),
            "offset-resumable" | "offset_resumable" | "tus" => Ok(Variant::OffsetResumable),
            other => Err(format!("unknown upload variant `{other}`")),
        }
    }
}

/// Coordinator-visible lifecycle of a session.
///
/// `Complete` and `Cancelled` are never persisted: reaching either removes the
/// session row. They still exist here so pollers and transition checks can name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Reserved,
    Uploading,
    AllPartsAcked,
    Finalizing,
    Complete,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::Reserved => "RESERVED",
            SessionState::Uploading => "UPLOADING",
            SessionState::AllPartsAcked => "ALL_PARTS_ACKED",
            SessionState::Finalizing => "FINALIZING",
            SessionState::Complete => "COMPLETE",
            SessionState::Cancelled => "CANCELLED",
            SessionState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Cancelled)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// A failed finalize keeps every uploaded byte, so `Failed` may go back to
    /// `AllPartsAcked`, retry `Finalizing`, or return to `Uploading` when a part is
    /// re-sent.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        if next == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (*self, next),
            (Created, Reserved)
                | (Reserved, Uploading)
                | (Reserved, AllPartsAcked)
                | (Uploading, Uploading)
                | (Uploading, AllPartsAcked)
                | (AllPartsAcked, AllPartsAcked)
                | (AllPartsAcked, Uploading)
                | (AllPartsAcked, Finalizing)
                | (Finalizing, Complete)
                | (Finalizing, Failed)
                | (Failed, AllPartsAcked)
                | (Failed, Finalizing)
                | (Failed, Uploading)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CREATED" => SessionState::Created,
            "RESERVED" => SessionState::Reserved,
            "UPLOADING" => SessionState::Uploading,
            "ALL_PARTS_ACKED" => SessionState::AllPartsAcked,
            "FINALIZING" => SessionState::Finalizing,
            "COMPLETE" => SessionState::Complete,
            "CANCELLED" => SessionState::Cancelled,
            "FAILED" => SessionState::Failed,
            other => return Err(format!("unknown session state `{other}`")),
        })
    }
}

/// Where the provider expects the bytes of a session to go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "kebab-case")]
pub enum ProviderHandle {
    #[serde(rename_all = "camelCase")]
    SignedPart { upload_id: String, key: String },
    /// `object_ref` is created eagerly by the provider at reservation time.
    #[serde(rename_all = "camelCase")]
    OffsetResumable { upload_url: String, object_ref: String },
}

impl ProviderHandle {
    pub fn variant(&self) -> Variant {
        match self {
            ProviderHandle::SignedPart { .. } => Variant::SignedPart,
            ProviderHandle::OffsetResumable { .. } => Variant::OffsetResumable,
        }
    }
}

/// One numbered part of a signed-part session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    /// 1-based, contiguous.
    pub part_number: u32,
    pub destination_url: String,
    /// Set iff the provider acknowledged this part.
    pub completion_token: Option<String>,
}

impl PartRecord {
    pub fn is_acknowledged(&self) -> bool {
        self.completion_token.is_some()
    }
}

/// Byte range of one planned part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_number: u32,
    pub offset: u64,
    pub len: u64,
}

/// Most parts a signed-part upload may be split into.
pub const MAX_PARTS: u64 = 10_000;

/// Split `total_bytes` into `ceil(total_bytes / chunk_size)` contiguous parts.
/// Allocates one entry per part; callers bound the count first.
/// Every part is `chunk_size` long except possibly the last.
pub fn plan_parts(total_bytes: u64, chunk_size: u64) -> Vec<PartRange> {
    if total_bytes == 0 || chunk_size == 0 {
        return Vec::new();
    }
    let count = total_bytes.div_ceil(chunk_size);
    (0..count)
        .map(|index| {
            let offset = index * chunk_size;
            PartRange {
                part_number: (index + 1) as u32,
                offset,
                len: chunk_size.min(total_bytes - offset),
            }
        })
        .collect()
}

/// The next chunk a driver has to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// `None` for offset-resumable sessions.
    pub part_number: Option<u32>,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressUnit {
    Parts,
    Bytes,
}

/// Acknowledged work over total work, in parts or bytes depending on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
    pub unit: ProgressUnit,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed >= self.total
    }
}

/// One in-flight large-file transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: Uuid,
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub state: SessionState,
    pub handle: ProviderHandle,
    /// Empty for offset-resumable sessions.
    pub parts: Vec<PartRecord>,
    /// Always zero for signed-part sessions.
    pub committed_offset: u64,
    /// Message of the last finalize rejection, if any.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn variant(&self) -> Variant {
        self.handle.variant()
    }

    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn part(&self, part_number: u32) -> Option<&PartRecord> {
        self.parts.iter().find(|p| p.part_number == part_number)
    }

    pub fn part_mut(&mut self, part_number: u32) -> Option<&mut PartRecord> {
        self.parts.iter_mut().find(|p| p.part_number == part_number)
    }

    /// Byte range covered by `part_number`, or `None` when out of range.
    pub fn part_range(&self, part_number: u32) -> Option<PartRange> {
        if part_number == 0 || part_number > self.part_count() {
            return None;
        }
        let offset = u64::from(part_number - 1) * self.chunk_size;
        Some(PartRange {
            part_number,
            offset,
            len: self.chunk_size.min(self.total_bytes.saturating_sub(offset)),
        })
    }

    pub fn acknowledged_parts(&self) -> usize {
        self.parts.iter().filter(|p| p.is_acknowledged()).count()
    }

    pub fn missing_parts(&self) -> Vec<u32> {
        self.parts
            .iter()
            .filter(|p| !p.is_acknowledged())
            .map(|p| p.part_number)
            .collect()
    }

    /// True once every part (or every byte) has been acknowledged by the provider.
    pub fn is_fully_acknowledged(&self) -> bool {
        match self.variant() {
            Variant::SignedPart => {
                !self.parts.is_empty() && self.parts.iter().all(PartRecord::is_acknowledged)
            }
            Variant::OffsetResumable => self.committed_offset >= self.total_bytes,
        }
    }

    pub fn progress(&self) -> Progress {
        match self.variant() {
            Variant::SignedPart => Progress {
                completed: self.acknowledged_parts() as u64,
                total: self.parts.len() as u64,
                unit: ProgressUnit::Parts,
            },
            Variant::OffsetResumable => Progress {
                completed: self.committed_offset,
                total: self.total_bytes,
                unit: ProgressUnit::Bytes,
            },
        }
    }

    /// The next chunk to send, strictly in increasing order; `None` when done.
    pub fn next_chunk(&self) -> Option<ChunkSpec> {
        match self.variant() {
            Variant::SignedPart => {
                let part = self.parts.iter().find(|p| !p.is_acknowledged())?;
                let range = self.part_range(part.part_number)?;
                Some(ChunkSpec {
                    part_number: Some(range.part_number),
                    offset: range.offset,
                    len: range.len,
                })
            }
            Variant::OffsetResumable => {
                if self.committed_offset >= self.total_bytes {
                    return None;
                }
                Some(ChunkSpec {
                    part_number: None,
                    offset: self.committed_offset,
                    len: self.chunk_size.min(self.total_bytes - self.committed_offset),
                })
            }
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What a poller sees of a session. Once finalized the session row is gone and the
/// status is derived from the resource instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_object_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionStatus {
    pub fn of(session: &UploadSession) -> Self {
        Self {
            session_id: session.id,
            state: session.state,
            progress: Some(session.progress()),
            provider_object_ref: None,
            last_error: session.last_error.clone(),
        }
    }

    pub fn completed(session_id: Uuid, provider_object_ref: String) -> Self {
        Self {
            session_id,
            state: SessionState::Complete,
            progress: None,
            provider_object_ref: Some(provider_object_ref),
            last_error: None,
        }
    }
}
