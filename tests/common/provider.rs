//! In-process hosting provider speaking both upload wire shapes, with failure
//! injection and call counters.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use serde_json::json;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::net::TcpListener;

pub const API_KEY: &str = "test-key";

#[derive(Default)]
pub struct SignedUpload {
    pub key: String,
    pub part_count: u32,
    pub versions: HashMap<u32, u32>,
    pub parts: HashMap<u32, Vec<u8>>,
}

#[derive(Default)]
pub struct TusUpload {
    pub uri: String,
    pub size: u64,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct Inner {
    pub base_url: String,
    next_id: u64,
    pub signed: HashMap<String, SignedUpload>,
    pub tus: HashMap<String, TusUpload>,
    /// Assembled objects by object reference.
    pub objects: HashMap<String, Vec<u8>>,

    // Failure injection.
    pub fail_part_once: HashSet<u32>,
    pub fail_part_always: HashSet<u32>,
    pub reject_finalize_once: bool,
    pub stall_next_patch: Option<Duration>,
    pub lose_next_patch_response: bool,
    /// Max bytes accepted by each successive PATCH; `None` accepts everything.
    pub patch_caps: VecDeque<Option<u64>>,

    // Counters.
    pub reserve_calls: u32,
    pub part_puts: HashMap<u32, u32>,
    pub reissues: HashMap<u32, u32>,
    pub finalize_calls: u32,
    pub patch_offsets: Vec<u64>,
    pub reserved_titles: Vec<String>,
}

#[derive(Clone)]
pub struct MockProvider {
    pub base_url: String,
    state: Arc<Mutex<Inner>>,
}

type Shared = Arc<Mutex<Inner>>;

impl MockProvider {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let state: Shared = Arc::new(Mutex::new(Inner {
            base_url: base_url.clone(),
            ..Inner::default()
        }));

        let app = Router::new()
            .route("/upload", put(reserve_signed))
            .route("/upload/{upload_id}/complete", post(complete_signed))
            .route("/upload/{upload_id}/{part_number}", get(reissue_signed))
            .route("/parts/{upload_id}/{part_number}", put(put_part))
            .route("/videos", post(reserve_tus))
            .route("/tus/{id}", patch(patch_tus))
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, state }
    }

    pub fn state(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap()
    }

    /// Invalidate every part URL handed out so far, as an expired signature would.
    pub fn expire_signatures(&self) {
        let mut state = self.state();
        for upload in state.signed.values_mut() {
            for version in upload.versions.values_mut() {
                *version += 1;
            }
        }
    }

    pub fn object(&self, object_ref: &str) -> Option<Vec<u8>> {
        self.state().objects.get(object_ref).cloned()
    }
}

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {API_KEY}");
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str())
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "missing api key"}))).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveSignedReq {
    size_bytes: u64,
    part_count: u32,
    title: String,
}

async fn reserve_signed(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(req): Json<ReserveSignedReq>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if req.size_bytes == 0 || req.part_count == 0 {
        return (StatusCode::BAD_REQUEST, "empty upload").into_response();
    }
    let mut state = state.lock().unwrap();
    state.reserve_calls += 1;
    state.next_id += 1;
    state.reserved_titles.push(req.title);
    let upload_id = format!("up-{}", state.next_id);
    let key = format!("videos/{}", state.next_id);
    let base = state.base_url.clone();

    let upload = SignedUpload {
        key: key.clone(),
        part_count: req.part_count,
        versions: (1..=req.part_count).map(|n| (n, 0)).collect(),
        parts: HashMap::new(),
    };
    let parts: Vec<_> = (1..=req.part_count)
        .map(|n| json!({"partNumber": n, "url": format!("{base}/parts/{upload_id}/{n}?sig=0")}))
        .collect();
    state.signed.insert(upload_id.clone(), upload);

    Json(json!({"uploadId": upload_id, "key": key, "parts": parts})).into_response()
}

#[derive(Deserialize)]
struct KeyQuery {
    key: String,
}

async fn reissue_signed(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((upload_id, part_number)): Path<(String, u32)>,
    Query(query): Query<KeyQuery>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut state = state.lock().unwrap();
    let base = state.base_url.clone();
    let Some(upload) = state.signed.get_mut(&upload_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if upload.key != query.key || part_number == 0 || part_number > upload.part_count {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let version = upload.versions.entry(part_number).or_default();
    *version += 1;
    let url = format!("{base}/parts/{upload_id}/{part_number}?sig={version}");
    *state.reissues.entry(part_number).or_default() += 1;
    Json(json!({"url": url})).into_response()
}

#[derive(Deserialize)]
struct SigQuery {
    sig: u32,
}

async fn put_part(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((upload_id, part_number)): Path<(String, u32)>,
    Query(query): Query<SigQuery>,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    *state.part_puts.entry(part_number).or_default() += 1;

    if state.fail_part_always.contains(&part_number) || state.fail_part_once.remove(&part_number)
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }

    let Some(upload) = state.signed.get_mut(&upload_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if upload.versions.get(&part_number) != Some(&query.sig) {
        return (StatusCode::FORBIDDEN, "SignatureDoesNotMatch").into_response();
    }
    let expected_md5 = general_purpose::STANDARD.encode(md5::compute(&body).0);
    let sent_md5 = headers.get("Content-MD5").and_then(|v| v.to_str().ok());
    if sent_md5 != Some(expected_md5.as_str()) {
        return (StatusCode::BAD_REQUEST, "BadDigest").into_response();
    }

    let etag = format!("\"{}\"", md5_hex(&body));
    upload.parts.insert(part_number, body.to_vec());
    (StatusCode::OK, [(header::ETAG, etag)]).into_response()
}

#[derive(Deserialize)]
struct CompleteReq {
    parts: Vec<CompletePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletePart {
    part_number: u32,
    e_tag: String,
}

async fn complete_signed(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(upload_id): Path<String>,
    Query(query): Query<KeyQuery>,
    Json(req): Json<CompleteReq>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut state = state.lock().unwrap();
    state.finalize_calls += 1;
    if state.reject_finalize_once {
        state.reject_finalize_once = false;
        return (StatusCode::BAD_REQUEST, "InvalidPart").into_response();
    }

    let Some(upload) = state.signed.get(&upload_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if upload.key != query.key || req.parts.len() != upload.part_count as usize {
        return (StatusCode::BAD_REQUEST, "InvalidPart").into_response();
    }
    let mut assembled = Vec::new();
    for (index, part) in req.parts.iter().enumerate() {
        let Some(bytes) = upload.parts.get(&part.part_number) else {
            return (StatusCode::BAD_REQUEST, "InvalidPart").into_response();
        };
        if part.part_number as usize != index + 1 || md5_hex(bytes) != part.e_tag {
            return (StatusCode::BAD_REQUEST, "InvalidPart").into_response();
        }
        assembled.extend_from_slice(bytes);
    }

    let object_id = md5_hex(&assembled);
    state.objects.insert(object_id.clone(), assembled);
    Json(json!({"objectId": object_id})).into_response()
}

#[derive(Deserialize)]
struct ReserveTusReq {
    upload: TusApproach,
    name: String,
}

#[derive(Deserialize)]
struct TusApproach {
    approach: String,
    size: u64,
}

async fn reserve_tus(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(req): Json<ReserveTusReq>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if req.upload.approach != "tus" || req.upload.size == 0 {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let mut state = state.lock().unwrap();
    state.reserve_calls += 1;
    state.next_id += 1;
    state.reserved_titles.push(req.name);
    let id = state.next_id.to_string();
    let uri = format!("/videos/{id}");
    let upload_link = format!("{}/tus/{id}", state.base_url);
    state.tus.insert(
        id,
        TusUpload {
            uri: uri.clone(),
            size: req.upload.size,
            data: Vec::new(),
        },
    );
    Json(json!({"uri": uri, "upload": {"upload_link": upload_link}})).into_response()
}

async fn patch_tus(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if headers.get("Tus-Resumable").and_then(|v| v.to_str().ok()) != Some("1.0.0") {
        return StatusCode::PRECONDITION_FAILED.into_response();
    }
    if headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
        != Some("application/offset+octet-stream")
    {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    let Some(offset) = headers
        .get("Upload-Offset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let (stall, lose, cap) = {
        let mut state = state.lock().unwrap();
        state.patch_offsets.push(offset);
        let cap = state.patch_caps.pop_front().flatten();
        (
            state.stall_next_patch.take(),
            std::mem::take(&mut state.lose_next_patch_response),
            cap,
        )
    };
    if let Some(delay) = stall {
        tokio::time::sleep(delay).await;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let mut state = state.lock().unwrap();
    let mut completed = None;
    let Some(upload) = state.tus.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let current = upload.data.len() as u64;
    if offset != current {
        return (StatusCode::CONFLICT, [("Upload-Offset", current.to_string())]).into_response();
    }
    let room = upload.size - current;
    let accept = cap
        .unwrap_or(u64::MAX)
        .min(body.len() as u64)
        .min(room) as usize;
    upload.data.extend_from_slice(&body[..accept]);
    let new_offset = upload.data.len() as u64;
    if new_offset == upload.size {
        completed = Some((upload.uri.clone(), upload.data.clone()));
    }
    if let Some((uri, data)) = completed {
        state.objects.insert(uri, data);
    }

    if lose {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (StatusCode::NO_CONTENT, [("Upload-Offset", new_offset.to_string())]).into_response()
}
