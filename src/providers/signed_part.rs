//! Signed-part uploads: the provider pre-creates one signed URL per part, each part
//! PUT returns an ETag, and a separate call assembles the parts.
//!
//! Wire shape (relative to the provider base URL):
//! - `PUT  /upload` `{sizeBytes, partCount, ..}` → `{uploadId, key, parts: [{partNumber, url}]}`
//! - `PUT  <part url>` raw bytes → `ETag: "<token>"`
//! - `GET  /upload/{uploadId}/{partNumber}?key=<key>` → `{url}`
//! - `POST /upload/{uploadId}/complete?key=<key>` `{parts: [{partNumber, eTag}]}` → `{objectId}`

use super::{
    ChunkAck, CompletedPart, ProviderAdapter, ProviderError, ProviderResult, ProviderSettings,
    Reservation, classify_api_status, classify_chunk_status,
};
use crate::models::{ProviderHandle, ResourceMetadata, Variant};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReserveRequest<'a> {
    size_bytes: u64,
    part_count: u32,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveResponse {
    upload_id: String,
    key: String,
    parts: Vec<PartUrl>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartUrl {
    part_number: u32,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ReissueResponse {
    url: String,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    parts: Vec<CompletePart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletePart<'a> {
    part_number: u32,
    e_tag: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteResponse {
    object_id: String,
}

pub struct SignedPartAdapter {
    http: Client,
    settings: ProviderSettings,
}

impl SignedPartAdapter {
    pub fn new(http: Client, settings: ProviderSettings) -> Self {
        Self { http, settings }
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> ProviderResult<T> {
        let response = self.settings.authorize(req).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_api_status(status, body));
        }
        serde_json::from_str(&body).map_err(|err| ProviderError::Malformed(err.to_string()))
    }

    fn upload_coordinates(handle: &ProviderHandle) -> ProviderResult<(&str, &str)> {
        match handle {
            ProviderHandle::SignedPart { upload_id, key } => Ok((upload_id, key)),
            ProviderHandle::OffsetResumable { .. } => {
                Err(ProviderError::Unsupported(Variant::OffsetResumable))
            }
        }
    }
}

/// Completion token from an `ETag` header value: providers quote it, we store it bare.
pub fn parse_etag(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix("W/")
        .unwrap_or(trimmed)
        .trim_matches('"')
        .trim();
    (!unquoted.is_empty()).then(|| unquoted.to_string())
}

/// Base64 MD5 of a chunk, as sent in `Content-MD5`.
pub fn content_md5(body: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(body).0)
}

#[async_trait]
impl ProviderAdapter for SignedPartAdapter {
    fn variant(&self) -> Variant {
        Variant::SignedPart
    }

    fn chunk_size(&self) -> u64 {
        self.settings.chunk_size
    }

    async fn reserve(
        &self,
        total_bytes: u64,
        part_count: u32,
        metadata: &ResourceMetadata,
    ) -> ProviderResult<Reservation> {
        let body = ReserveRequest {
            size_bytes: total_bytes,
            part_count,
            title: metadata.display_title(),
            description: metadata.description.as_deref(),
            mime_type: metadata.mime_type.as_deref(),
        };
        let url = self.settings.endpoint("/upload");
        let reserved: ReserveResponse = self.send_json(self.http.put(url).json(&body)).await?;

        let mut part_urls: Vec<(u32, String)> = reserved
            .parts
            .into_iter()
            .map(|p| (p.part_number, p.url))
            .collect();
        part_urls.sort_by_key(|(n, _)| *n);
        let contiguous = part_urls
            .iter()
            .enumerate()
            .all(|(index, (n, _))| *n as usize == index + 1);
        if part_urls.len() != part_count as usize || !contiguous {
            return Err(ProviderError::Malformed(format!(
                "expected parts 1..={part_count}, provider returned {}",
                part_urls.len()
            )));
        }

        debug!(upload_id = %reserved.upload_id, part_count, "reserved signed-part upload");
        Ok(Reservation {
            handle: ProviderHandle::SignedPart {
                upload_id: reserved.upload_id,
                key: reserved.key,
            },
            part_urls,
        })
    }

    async fn reissue_part(
        &self,
        handle: &ProviderHandle,
        part_number: u32,
    ) -> ProviderResult<String> {
        let (upload_id, key) = Self::upload_coordinates(handle)?;
        let url = self
            .settings
            .endpoint(&format!("/upload/{upload_id}/{part_number}"));
        let reissued: ReissueResponse = self
            .send_json(self.http.get(url).query(&[("key", key)]))
            .await?;
        Ok(reissued.url)
    }

    async fn upload_chunk(
        &self,
        destination: &str,
        _offset: u64,
        body: Bytes,
    ) -> ProviderResult<ChunkAck> {
        let checksum = content_md5(&body);
        let response = self
            .http
            .put(destination)
            .header("Content-MD5", checksum)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_chunk_status(status, body));
        }

        response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_etag)
            .map(ChunkAck::Token)
            .ok_or_else(|| ProviderError::Malformed("part upload response has no ETag".into()))
    }

    async fn finalize(
        &self,
        handle: &ProviderHandle,
        parts: &[CompletedPart],
    ) -> ProviderResult<String> {
        let (upload_id, key) = Self::upload_coordinates(handle)?;
        let body = CompleteRequest {
            parts: parts
                .iter()
                .map(|p| CompletePart {
                    part_number: p.part_number,
                    e_tag: &p.etag,
                })
                .collect(),
        };
        let url = self
            .settings
            .endpoint(&format!("/upload/{upload_id}/complete"));
        let completed: CompleteResponse = self
            .send_json(self.http.post(url).query(&[("key", key)]).json(&body))
            .await?;
        if completed.object_id.trim().is_empty() {
            return Err(ProviderError::Malformed("finalize returned an empty objectId".into()));
        }
        Ok(completed.object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_quotes_are_stripped() {
        assert_eq!(parse_etag("\"abc123\""), Some("abc123".to_string()));
        assert_eq!(parse_etag("W/\"weak\""), Some("weak".to_string()));
        assert_eq!(parse_etag("bare"), Some("bare".to_string()));
        assert_eq!(parse_etag("\"\""), None);
    }

    #[test]
    fn complete_body_uses_wire_field_names() {
        let body = CompleteRequest {
            parts: vec![CompletePart {
                part_number: 1,
                e_tag: "abc",
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"parts": [{"partNumber": 1, "eTag": "abc"}]}));
    }

    #[test]
    fn content_md5_is_base64_digest() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(content_md5(b""), "1B2M2Y8AskTpgAmY7PhCfg==");
    }
}
