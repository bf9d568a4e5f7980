//! HTTP handlers for upload sessions and the resources they produce.
//! Request bodies are validated here; every decision about session state is left to
//! `UploadService`.

use crate::{
    errors::{AppError, UploadError},
    models::{ResourceMetadata, SessionStatus, UploadSession},
    services::UploadService,
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /uploads`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadReq {
    /// Signed so that zero and negative sizes reach validation instead of failing
    /// deserialization.
    pub total_bytes: i64,
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

/// Body of `PUT /uploads/{id}/parts/{n}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPartReq {
    pub e_tag: String,
}

#[derive(Debug, Serialize)]
pub struct DestinationResp {
    pub url: String,
}

/// Create a session: `POST /uploads`.
pub async fn create_upload(
    State(service): State<UploadService>,
    Json(req): Json<CreateUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let total_bytes = u64::try_from(req.total_bytes)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| UploadError::invalid("totalBytes must be greater than zero"))?;

    let metadata = ResourceMetadata {
        name: req.name,
        title: req.title,
        description: req.description,
        mime_type: req.mime_type,
    };
    let session: UploadSession = service.create_session(total_bytes, metadata).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// Poll a session: `GET /uploads/{id}`.
pub async fn get_upload(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionStatus>, AppError> {
    Ok(Json(service.poll(id).await?))
}

/// Send the next chunk: `PUT /uploads/{id}/chunk` with the raw bytes as body.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<SessionStatus>, AppError> {
    Ok(Json(service.upload_chunk(id, body).await?))
}

/// Fresh destination for one part: `POST /uploads/{id}/parts/{n}/destination`.
pub async fn reissue_destination(
    State(service): State<UploadService>,
    Path((id, part_number)): Path<(Uuid, u32)>,
) -> Result<Json<DestinationResp>, AppError> {
    let url = service.reissue_destination(id, part_number).await?;
    Ok(Json(DestinationResp { url }))
}

/// Record a part acknowledged outside this service: `PUT /uploads/{id}/parts/{n}`.
pub async fn report_part(
    State(service): State<UploadService>,
    Path((id, part_number)): Path<(Uuid, u32)>,
    Json(req): Json<ReportPartReq>,
) -> Result<StatusCode, AppError> {
    service
        .report_part_complete(id, part_number, &req.e_tag)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /uploads/{id}/finalize`
pub async fn finalize_upload(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionStatus>, AppError> {
    Ok(Json(service.finalize_or_poll(id).await?))
}

/// `DELETE /uploads/{id}`
pub async fn cancel_upload(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    service.cancel_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /resources/{id}`
pub async fn get_resource(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let resource = service
        .resource(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("resource `{id}` not found")))?;
    Ok(Json(resource))
}
