mod common;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use common::{
    MIB, count_rows, fast_policy, pattern,
    provider::{MockProvider, md5_hex},
    service,
};
use http_body_util::BodyExt;
use media_upload::{
    models::Variant,
    providers::signed_part::content_md5,
    routes::routes::routes,
    services::{RetryPolicy, UploadService},
};
use serde_json::{Value, json};
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

const CHUNK: u64 = 10;

async fn app(provider: &MockProvider) -> (Router, UploadService) {
    let service = service(provider, Variant::SignedPart, CHUNK, fast_policy()).await;
    let router = routes(MIB as usize).with_state(service.clone());
    (router, service)
}

async fn send(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Value) {
    let content_type = if method == Method::PUT && uri.ends_with("/chunk") {
        "application/octet-stream"
    } else {
        "application/json"
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(app: &Router, total_bytes: i64) -> (StatusCode, Value) {
    let body = json!({"totalBytes": total_bytes, "name": "Lecture 1", "title": "Week one"});
    send(app, Method::POST, "/uploads", Body::from(body.to_string())).await
}

fn session_id(session: &Value) -> Uuid {
    session["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn health_endpoints_report_ok() {
    let provider = MockProvider::start().await;
    let (app, _) = app(&provider).await;

    let (status, body) = send(&app, Method::GET, "/healthz", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, Method::GET, "/readyz", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["variant"], "signed-part");
    assert_eq!(body["checks"]["schema"]["ok"], true);
}

#[tokio::test]
async fn zero_size_is_rejected_without_side_effects() {
    let provider = MockProvider::start().await;
    let (app, service) = app(&provider).await;

    let (status, body) = create(&app, 0).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
    assert!(body["error"].as_str().unwrap().contains("totalBytes"));

    assert_eq!(count_rows(&service.db, "media_resources").await, 0);
    assert_eq!(count_rows(&service.db, "upload_sessions").await, 0);
    assert_eq!(provider.state().reserve_calls, 0);
}

#[tokio::test]
async fn chunked_upload_over_http_completes() {
    let provider = MockProvider::start().await;
    let (app, _) = app(&provider).await;
    let data = pattern(25);

    let (status, session) = create(&app, 25).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["state"], "RESERVED");
    assert_eq!(session["parts"].as_array().unwrap().len(), 3);
    assert_eq!(provider.state().reserved_titles, vec!["Week one".to_string()]);
    let id = session_id(&session);

    let chunk_uri = format!("/uploads/{id}/chunk");
    for (index, chunk) in data.chunks(CHUNK as usize).enumerate() {
        let (status, body) = send(&app, Method::PUT, &chunk_uri, Body::from(chunk.to_vec())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["progress"]["completed"], index as u64 + 1);
        assert_eq!(body["progress"]["total"], 3);
    }

    let (status, body) = send(&app, Method::GET, &format!("/uploads/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "ALL_PARTS_ACKED");

    let (status, body) =
        send(&app, Method::POST, &format!("/uploads/{id}/finalize"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "COMPLETE");
    assert_eq!(body["providerObjectRef"], md5_hex(&data));

    let (status, resource) =
        send(&app, Method::GET, &format!("/resources/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resource["name"], "Lecture 1");
    assert_eq!(resource["providerObjectRef"], md5_hex(&data));

    // Polling after finalize still answers, from the resource.
    let (status, body) = send(&app, Method::GET, &format!("/uploads/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "COMPLETE");
}

#[tokio::test]
async fn chunk_of_wrong_length_is_rejected() {
    let provider = MockProvider::start().await;
    let (app, _) = app(&provider).await;
    let (_, session) = create(&app, 25).await;
    let id = session_id(&session);

    let (status, body) = send(
        &app,
        Method::PUT,
        &format!("/uploads/{id}/chunk"),
        Body::from(vec![0u8; 7]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("10 bytes"));
    assert!(provider.state().part_puts.is_empty());
}

#[tokio::test]
async fn early_finalize_reports_progress() {
    let provider = MockProvider::start().await;
    let (app, _) = app(&provider).await;
    let data = pattern(25);
    let (_, session) = create(&app, 25).await;
    let id = session_id(&session);

    send(
        &app,
        Method::PUT,
        &format!("/uploads/{id}/chunk"),
        Body::from(data[..10].to_vec()),
    )
    .await;

    let (status, body) =
        send(&app, Method::POST, &format!("/uploads/{id}/finalize"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "UPLOADING");
    assert_eq!(body["progress"]["completed"], 1);
    assert_eq!(provider.state().finalize_calls, 0);
}

#[tokio::test]
async fn parts_sent_by_the_caller_can_be_reported() {
    let provider = MockProvider::start().await;
    let (app, _) = app(&provider).await;
    let data = pattern(25);
    let (_, session) = create(&app, 25).await;
    let id = session_id(&session);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/uploads/{id}/parts/1/destination"),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let url = body["url"].as_str().unwrap().to_string();
    assert!(url.ends_with("sig=1"));

    // Send part 1 straight to the provider, as a browser would.
    let part = data[..10].to_vec();
    let response = reqwest::Client::new()
        .put(&url)
        .header("Content-MD5", content_md5(&part))
        .body(part)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();

    let report = json!({"eTag": etag}).to_string();
    let uri = format!("/uploads/{id}/parts/1");
    let (status, _) = send(&app, Method::PUT, &uri, Body::from(report.clone())).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    // Reporting the same token twice is harmless.
    let (status, _) = send(&app, Method::PUT, &uri, Body::from(report)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, Method::GET, &format!("/uploads/{id}"), Body::empty()).await;
    assert_eq!(body["state"], "UPLOADING");
    assert_eq!(body["progress"]["completed"], 1);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/uploads/{id}/parts/9/destination"),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let provider = MockProvider::start().await;
    let (app, _) = app(&provider).await;
    let id = Uuid::new_v4();

    let (status, body) = send(&app, Method::GET, &format!("/uploads/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);

    let (status, _) = send(&app, Method::DELETE, &format!("/uploads/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_removes_the_placeholder() {
    let provider = MockProvider::start().await;
    let (app, service) = app(&provider).await;
    let (_, session) = create(&app, 25).await;
    let id = session_id(&session);

    let (status, _) = send(&app, Method::DELETE, &format!("/uploads/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, Method::GET, &format!("/resources/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(count_rows(&service.db, "upload_parts").await, 0);
}

#[tokio::test]
async fn cancel_after_finalize_leaves_the_resource() {
    let provider = MockProvider::start().await;
    let (app, _) = app(&provider).await;
    let data = pattern(15);
    let (_, session) = create(&app, 15).await;
    let id = session_id(&session);

    for chunk in data.chunks(CHUNK as usize) {
        send(
            &app,
            Method::PUT,
            &format!("/uploads/{id}/chunk"),
            Body::from(chunk.to_vec()),
        )
        .await;
    }
    let (_, body) =
        send(&app, Method::POST, &format!("/uploads/{id}/finalize"), Body::empty()).await;
    assert_eq!(body["state"], "COMPLETE");

    let (status, _) = send(&app, Method::DELETE, &format!("/uploads/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, resource) =
        send(&app, Method::GET, &format!("/resources/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resource["providerObjectRef"], md5_hex(&data));
}

#[tokio::test]
async fn oversized_upload_is_rejected() {
    let provider = MockProvider::start().await;
    let (app, service) = app(&provider).await;

    let (status, body) = create(&app, i64::MAX).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("limit"));
    assert_eq!(count_rows(&service.db, "media_resources").await, 0);
    assert_eq!(provider.state().reserve_calls, 0);
}

#[tokio::test]
async fn cancel_interrupts_chunk_backoff() {
    let provider = MockProvider::start().await;
    provider.state().fail_part_always.insert(1);
    let policy = RetryPolicy {
        max_attempts_per_chunk: 10,
        backoff_base: Duration::from_secs(5),
        backoff_cap: Duration::from_secs(5),
        ..fast_policy()
    };
    let service = service(&provider, Variant::SignedPart, CHUNK, policy).await;
    let app = routes(MIB as usize).with_state(service.clone());
    let (_, session) = create(&app, 25).await;
    let id = session_id(&session);

    let chunk = tokio::spawn({
        let app = app.clone();
        async move {
            send(
                &app,
                Method::PUT,
                &format!("/uploads/{id}/chunk"),
                Body::from(pattern(CHUNK)),
            )
            .await
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (status, _) = tokio::time::timeout(
        Duration::from_secs(3),
        send(&app, Method::DELETE, &format!("/uploads/{id}"), Body::empty()),
    )
    .await
    .expect("cancel does not wait out the backoff");
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = chunk.await.unwrap();
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("cancelled"));
    assert_eq!(provider.state().part_puts.get(&1), Some(&1));

    let (status, _) = send(&app, Method::GET, &format!("/resources/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(count_rows(&service.db, "upload_sessions").await, 0);
}
