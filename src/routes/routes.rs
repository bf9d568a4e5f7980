//! Defines routes for upload sessions and the resources they produce.
//!
//! ## Structure
//! - **Session endpoints**
//!   - `POST   /uploads`: create a session (placeholder + provider reservation)
//!   - `GET    /uploads/{id}`: poll status and progress
//!   - `PUT    /uploads/{id}/chunk`: send the next chunk (raw bytes)
//!   - `POST   /uploads/{id}/finalize`: finalize, or report progress if incomplete
//!   - `DELETE /uploads/{id}`: cancel
//!
//! - **Part endpoints** (signed-part sessions)
//!   - `POST   /uploads/{id}/parts/{n}/destination`: reissue a part URL
//!   - `PUT    /uploads/{id}/parts/{n}`: report a part's ETag
//!
//! - **Resources**
//!   - `GET    /resources/{id}`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            cancel_upload, create_upload, finalize_upload, get_resource, get_upload,
            reissue_destination, report_part, upload_chunk,
        },
    },
    services::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router. `max_chunk_bytes` bounds the body of a chunk upload.
pub fn routes(max_chunk_bytes: usize) -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Session routes
        .route("/uploads", post(create_upload))
        .route("/uploads/{id}", get(get_upload).delete(cancel_upload))
        .route(
            "/uploads/{id}/chunk",
            put(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_bytes)),
        )
        .route("/uploads/{id}/finalize", post(finalize_upload))
        // Part routes
        .route(
            "/uploads/{id}/parts/{part_number}/destination",
            post(reissue_destination),
        )
        .route("/uploads/{id}/parts/{part_number}", put(report_part))
        // Resources
        .route("/resources/{id}", get(get_resource))
}
