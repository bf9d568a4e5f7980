//! Offset-resumable (tus-style) uploads: one upload URL, successive `PATCH` requests,
//! and the provider reports the next offset it expects. There is no finalize call;
//! the provider object exists from reservation onwards and is complete once the
//! offset reaches the declared size.
//!
//! Wire shape:
//! - `POST /videos` `{upload: {approach: "tus", size}, name, description}` →
//!   `{uri, upload: {upload_link}}`
//! - `PATCH <upload_link>` with `Upload-Offset: n`, `Tus-Resumable: 1.0.0`,
//!   `Content-Type: application/offset+octet-stream` → `Upload-Offset: <new>`

use super::{
    ChunkAck, CompletedPart, ProviderAdapter, ProviderError, ProviderResult, ProviderSettings,
    Reservation, classify_api_status, classify_chunk_status,
};
use crate::models::{ProviderHandle, ResourceMetadata, Variant};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, header::HeaderMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const UPLOAD_OFFSET: &str = "Upload-Offset";
pub const TUS_RESUMABLE: &str = "Tus-Resumable";
pub const TUS_VERSION: &str = "1.0.0";
pub const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

#[derive(Debug, Serialize)]
struct ReserveRequest<'a> {
    upload: UploadApproach,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct UploadApproach {
    approach: &'static str,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct ReserveResponse {
    uri: String,
    upload: UploadLink,
}

#[derive(Debug, Deserialize)]
struct UploadLink {
    upload_link: String,
}

pub struct OffsetResumableAdapter {
    http: Client,
    settings: ProviderSettings,
}

impl OffsetResumableAdapter {
    pub fn new(http: Client, settings: ProviderSettings) -> Self {
        Self { http, settings }
    }
}

/// The `Upload-Offset` header of a provider response, if present and numeric.
pub fn parse_upload_offset(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(UPLOAD_OFFSET)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[async_trait]
impl ProviderAdapter for OffsetResumableAdapter {
    fn variant(&self) -> Variant {
        Variant::OffsetResumable
    }

    fn chunk_size(&self) -> u64 {
        self.settings.chunk_size
    }

    async fn reserve(
        &self,
        total_bytes: u64,
        _part_count: u32,
        metadata: &ResourceMetadata,
    ) -> ProviderResult<Reservation> {
        let body = ReserveRequest {
            upload: UploadApproach {
                approach: "tus",
                size: total_bytes,
            },
            name: metadata.display_title(),
            description: metadata.description.as_deref(),
        };
        let req = self.http.post(self.settings.endpoint("/videos")).json(&body);
        let response = self.settings.authorize(req).send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_api_status(status, text));
        }
        let reserved: ReserveResponse =
            serde_json::from_str(&text).map_err(|err| ProviderError::Malformed(err.to_string()))?;

        debug!(object_ref = %reserved.uri, "reserved offset-resumable upload");
        Ok(Reservation {
            handle: ProviderHandle::OffsetResumable {
                upload_url: reserved.upload.upload_link,
                object_ref: reserved.uri,
            },
            part_urls: Vec::new(),
        })
    }

    async fn reissue_part(
        &self,
        _handle: &ProviderHandle,
        _part_number: u32,
    ) -> ProviderResult<String> {
        Err(ProviderError::Unsupported(Variant::OffsetResumable))
    }

    async fn upload_chunk(
        &self,
        destination: &str,
        offset: u64,
        body: Bytes,
    ) -> ProviderResult<ChunkAck> {
        let response = self
            .http
            .patch(destination)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_OFFSET, offset.to_string())
            .header(reqwest::header::CONTENT_TYPE, OFFSET_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let reported = parse_upload_offset(response.headers());
        if status.is_success() {
            return reported.map(ChunkAck::Offset).ok_or_else(|| {
                ProviderError::Malformed("PATCH response has no Upload-Offset".into())
            });
        }
        // 409: the provider's offset differs from ours. Its value is authoritative.
        if status == StatusCode::CONFLICT {
            if let Some(current) = reported {
                return Ok(ChunkAck::Offset(current));
            }
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify_chunk_status(status, text))
    }

    async fn finalize(
        &self,
        handle: &ProviderHandle,
        _parts: &[CompletedPart],
    ) -> ProviderResult<String> {
        match handle {
            ProviderHandle::OffsetResumable { object_ref, .. } => Ok(object_ref.clone()),
            ProviderHandle::SignedPart { .. } => Err(ProviderError::Unsupported(Variant::SignedPart)),
        }
    }
}
