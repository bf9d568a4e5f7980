//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness, no I/O
//! - GET /readyz   -> database reachable and upload schema applied

use crate::services::UploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// Runs `SELECT 1`, then counts open upload sessions (fails when migrations have not
/// been applied). 200 when both pass, 503 otherwise. The configured provider variant
/// is echoed so deployments can be told apart.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let sqlite = scalar_check(&service.db, "SELECT 1").await;
    let schema = scalar_check(&service.db, "SELECT COUNT(*) FROM upload_sessions").await;

    let ready = matches!(sqlite, Ok(1)) && schema.is_ok();
    let open_sessions = schema.as_ref().ok().copied();

    let mut checks = BTreeMap::new();
    checks.insert("sqlite", CheckStatus::from_result(sqlite, |v| v == 1));
    checks.insert("schema", CheckStatus::from_result(schema, |_| true));

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        variant: service.variant().as_str(),
        open_sessions,
        checks,
    };
    (status, Json(body))
}

async fn scalar_check(db: &SqlitePool, sql: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(sql).fetch_one(db).await
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadyResponse {
    status: &'static str,
    variant: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    open_sessions: Option<i64>,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn from_result(result: Result<i64, sqlx::Error>, expected: impl Fn(i64) -> bool) -> Self {
        match result {
            Ok(v) if expected(v) => Self {
                ok: true,
                error: None,
            },
            Ok(v) => Self {
                ok: false,
                error: Some(format!("unexpected result: {v}")),
            },
            Err(e) => Self {
                ok: false,
                error: Some(format!("error: {e}")),
            },
        }
    }
}
