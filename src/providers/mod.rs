//! Provider adapters: the wire shape of one hosting provider's upload protocol.
//!
//! The coordinator and the transfer client only talk to [`ProviderAdapter`]; the
//! concrete variant is picked from configuration when the service starts, so neither
//! side special-cases a provider by name.

pub mod offset_resumable;
pub mod signed_part;

use crate::models::{ProviderHandle, ResourceMetadata, Variant};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{RequestBuilder, StatusCode};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

pub use offset_resumable::OffsetResumableAdapter;
pub use signed_part::SignedPartAdapter;

/// Failure of a single provider call, classified by what the caller should do next.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Connection failure, timeout, 5xx or throttling. Retry the same step.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The provider refused a previously issued destination (expired signature).
    #[error("destination expired: {0}")]
    DestinationExpired(String),

    /// Semantic rejection, e.g. a missing part or checksum mismatch at finalize.
    #[error("provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The response did not have the expected shape.
    #[error("malformed provider response: {0}")]
    Malformed(String),

    /// The adapter does not implement this operation.
    #[error("operation not supported by {0} providers")]
    Unsupported(Variant),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

/// Result of reserving an upload destination for a whole file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub handle: ProviderHandle,
    /// Per-part destinations, ordered by part number. Empty for offset-resumable.
    pub part_urls: Vec<(u32, String)>,
}

/// What the provider said after receiving one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    /// Completion token of a signed part (the ETag, quotes stripped).
    Token(String),
    /// Provider-confirmed offset of an offset-resumable upload.
    Offset(u64),
}

/// A part acknowledged by the provider, as submitted back at finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// One upload protocol variant.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn variant(&self) -> Variant;

    /// Bytes per chunk this provider expects.
    fn chunk_size(&self) -> u64;

    /// Reserve a destination sized for `total_bytes`, split into `part_count` parts
    /// when the variant uses parts.
    async fn reserve(
        &self,
        total_bytes: u64,
        part_count: u32,
        metadata: &ResourceMetadata,
    ) -> ProviderResult<Reservation>;

    /// Fresh destination for exactly one part. The previous URL is discarded.
    async fn reissue_part(&self, handle: &ProviderHandle, part_number: u32)
    -> ProviderResult<String>;

    /// Send one chunk starting at `offset` to `destination`.
    async fn upload_chunk(
        &self,
        destination: &str,
        offset: u64,
        body: Bytes,
    ) -> ProviderResult<ChunkAck>;

    /// Assemble the uploaded parts into one object and return its reference.
    async fn finalize(
        &self,
        handle: &ProviderHandle,
        parts: &[CompletedPart],
    ) -> ProviderResult<String>;
}

pub type SharedAdapter = Arc<dyn ProviderAdapter>;

/// Connection settings shared by both adapters.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chunk_size: u64,
    pub request_timeout: Duration,
}

impl ProviderSettings {
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Attach the bearer token used by provider API calls (not by part uploads,
    /// whose URLs are already signed).
    pub fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

/// Build the adapter configured for this process.
pub fn build_adapter(variant: Variant, settings: ProviderSettings) -> ProviderResult<SharedAdapter> {
    let http = reqwest::Client::builder()
        .timeout(settings.request_timeout)
        .build()
        .map_err(|err| ProviderError::Transient(err.to_string()))?;
    Ok(match variant {
        Variant::SignedPart => Arc::new(SignedPartAdapter::new(http, settings)),
        Variant::OffsetResumable => Arc::new(OffsetResumableAdapter::new(http, settings)),
    })
}

/// Classify a non-success status on a chunk upload.
pub(crate) fn classify_chunk_status(status: StatusCode, body: String) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::GONE => ProviderError::DestinationExpired(format!("{status}: {body}")),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::Transient(format!("{status}: {body}"))
        }
        s => ProviderError::Rejected {
            status: s.as_u16(),
            body,
        },
    }
}

/// Classify a non-success status on a provider API call (reserve, reissue, finalize).
pub(crate) fn classify_api_status(status: StatusCode, body: String) -> ProviderError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient(format!("{status}: {body}"))
    } else {
        ProviderError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}
