use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    gemini::ImageGenerator,
    intake::{self, IntakeError},
    models::{ImageSlot, OptionsRequest, SetImageRequest, SetModeRequest},
    studio::{run_batch, Batch, Studio, StudioError},
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RwLock<HashMap<Uuid, Studio>>>,
    pub generator: Arc<dyn ImageGenerator>,
}

impl AppState {
    pub fn new(generator: Arc<dyn ImageGenerator>) -> Self {
        Self { store: Arc::default(), generator }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session not found")] SessionNotFound,
    #[error("unknown image slot: {0}")] UnknownSlot(String),
    #[error("result {0} not found")] NoSuchResult(usize),
    #[error("upload failed: {0}")] Upload(String),
    #[error(transparent)] Intake(#[from] IntakeError),
    #[error(transparent)] Studio(#[from] StudioError),
    #[error("{0}")] Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::SessionNotFound | ApiError::UnknownSlot(_) | ApiError::NoSuchResult(_) => StatusCode::NOT_FOUND,
            ApiError::Studio(StudioError::NoSuchHistory(_)) => StatusCode::NOT_FOUND,
            ApiError::Studio(StudioError::Busy) => StatusCode::CONFLICT,
            ApiError::Upload(_) => StatusCode::BAD_REQUEST,
            ApiError::Intake(_) | ApiError::Studio(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("❌ {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    #[serde(flatten)]
    pub studio: Studio,
}

fn slot(raw: &str) -> Result<ImageSlot, ApiError> {
    ImageSlot::parse(raw).ok_or_else(|| ApiError::UnknownSlot(raw.to_string()))
}

/// Runs `f` on the session under the write lock and returns its new state.
fn update<F>(state: &AppState, id: Uuid, f: F) -> Result<Json<SessionView>, ApiError>
where
    F: FnOnce(&mut Studio) -> Result<(), StudioError>,
{
    let mut guard = state.store.write();
    let studio = guard.get_mut(&id).ok_or(ApiError::SessionNotFound)?;
    f(studio)?;
    Ok(Json(SessionView { id, studio: studio.clone() }))
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/mode", put(set_mode))
        .route("/api/sessions/:id/images/:slot", put(set_image).delete(clear_image))
        .route("/api/sessions/:id/images/:slot/upload", post(upload_image))
        .route("/api/sessions/:id/options", put(set_options))
        .route("/api/sessions/:id/generate", post(generate))
        .route("/api/sessions/:id/regenerate", post(regenerate))
        .route("/api/sessions/:id/continue", post(continue_editing))
        .route("/api/sessions/:id/start-over", post(start_over))
        .route("/api/sessions/:id/history/:index/restore", post(restore_history))
        .route("/api/sessions/:id/results/:n/download", get(download_result))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

async fn health() -> &'static str { "ok" }

pub async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<SessionView>) {
    let id = Uuid::new_v4();
    let studio = Studio::new();
    state.store.write().insert(id, studio.clone());
    tracing::info!("🎯 Created session {}", id);
    (StatusCode::CREATED, Json(SessionView { id, studio }))
}

pub async fn get_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    update(&state, id, |_| Ok(()))
}

pub async fn delete_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> StatusCode {
    if state.store.write().remove(&id).is_some() { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND }
}

pub async fn set_mode(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<SetModeRequest>,
) -> Result<Json<SessionView>, ApiError> {
    update(&state, id, |studio| studio.set_mode(body.mode))
}

pub async fn set_image(
    Path((id, raw_slot)): Path<(Uuid, String)>,
    State(state): State<AppState>,
    Json(body): Json<SetImageRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let slot = slot(&raw_slot)?;
    update(&state, id, |studio| studio.set_image(slot, body.data_url))
}

pub async fn upload_image(
    Path((id, raw_slot)): Path<(Uuid, String)>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SessionView>, ApiError> {
    let slot = slot(&raw_slot)?;
    // Read the whole file before touching the session lock.
    // Text fields ahead of the file are skipped.
    let (content_type, file_name, bytes) = loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::Upload(e.to_string()))?
            .ok_or_else(|| ApiError::Upload("no file in form".into()))?;
        if field.name() == Some("file") || field.file_name().is_some() {
            let content_type = field.content_type().map(str::to_string);
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let bytes = field.bytes().await.map_err(|e| ApiError::Upload(e.to_string()))?;
            break (content_type, file_name, bytes);
        }
    };

    let data_url = intake::encode_file(&bytes, content_type.as_deref())?;
    tracing::info!("📥 {} upload '{}' ({} bytes): {}", slot, file_name, bytes.len(), intake::preview(&data_url));
    update(&state, id, |studio| studio.set_image(slot, data_url))
}

pub async fn clear_image(
    Path((id, raw_slot)): Path<(Uuid, String)>,
    State(state): State<AppState>,
) -> Result<Json<SessionView>, ApiError> {
    let slot = slot(&raw_slot)?;
    update(&state, id, |studio| studio.clear_image(slot))
}

pub async fn set_options(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<OptionsRequest>,
) -> Result<Json<SessionView>, ApiError> {
    update(&state, id, |studio| studio.set_options(body))
}

// Validation failures are session state, not HTTP errors: the idle screen
// carries the message.
async fn dispatch(
    state: AppState,
    id: Uuid,
    start: fn(&mut Studio) -> Result<Batch, StudioError>,
) -> Result<Json<SessionView>, ApiError> {
    let batch = {
        let mut guard = state.store.write();
        let studio = guard.get_mut(&id).ok_or(ApiError::SessionNotFound)?;
        match start(studio) {
            Ok(batch) => batch,
            Err(StudioError::Validation(_)) => return Ok(Json(SessionView { id, studio: studio.clone() })),
            Err(e) => return Err(e.into()),
        }
    };

    tracing::info!("🚀 Session {} dispatching batch {} ({} requests)", id, batch.id, batch.count);
    // The batch runs in its own task so the outcome is applied even if the
    // client goes away and this handler is dropped.
    let task = tokio::spawn(async move {
        let outcome = run_batch(state.generator.as_ref(), &batch).await;
        let mut guard = state.store.write();
        let studio = guard.get_mut(&id)?;
        studio.complete_batch(&batch, outcome);
        Some(SessionView { id, studio: studio.clone() })
    });

    match task.await {
        Ok(Some(view)) => Ok(Json(view)),
        Ok(None) => Err(ApiError::SessionNotFound),
        Err(e) => Err(ApiError::Internal(format!("batch task failed: {e}"))),
    }
}

pub async fn generate(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    dispatch(state, id, Studio::prepare_batch).await
}

pub async fn regenerate(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    dispatch(state, id, Studio::regenerate).await
}

pub async fn continue_editing(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    update(&state, id, Studio::continue_editing)
}

pub async fn start_over(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    update(&state, id, |studio| {
        studio.start_over();
        Ok(())
    })
}

pub async fn restore_history(
    Path((id, index)): Path<(Uuid, usize)>,
    State(state): State<AppState>,
) -> Result<Json<SessionView>, ApiError> {
    update(&state, id, |studio| studio.restore(index))
}

pub async fn download_result(
    Path((id, n)): Path<(Uuid, usize)>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let data_url = {
        let guard = state.store.read();
        let studio = guard.get(&id).ok_or(ApiError::SessionNotFound)?;
        studio.result(n).ok_or(ApiError::NoSuchResult(n))?.to_string()
    };
    let (mime, bytes) = intake::decode_data_url(&data_url)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&mime).map_err(|e| ApiError::Internal(e.to_string()))?,
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", intake::download_filename(n)))
            .map_err(|e| ApiError::Internal(e.to_string()))?,
    );
    Ok((StatusCode::OK, headers, Bytes::from(bytes)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::studio::fake::{encoded, FakeGenerator};
    use axum::body::Body;
    use axum::http::Request;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tower::ServiceExt;

    const PNG_URL: &str = "data:image/png;base64,aGVsbG8=";

    fn app(generator: Arc<FakeGenerator>) -> Router {
        router(AppState::new(generator), 1024 * 1024)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let (status, _, bytes) = send(app, request).await;
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    async fn new_session(app: &Router) -> String {
        let (status, body) = call(app, "POST", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["phase"], json!({"state": "idle", "error": null}));
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn character_flow_generates_and_downloads() {
        let generator = Arc::new(FakeGenerator::default());
        let app = app(generator.clone());
        let id = new_session(&app).await;

        for slot in ["character", "product"] {
            let (status, _) = call(&app, "PUT", &format!("/api/sessions/{id}/images/{slot}"), Some(json!({"data_url": PNG_URL}))).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = call(&app, "PUT", &format!("/api/sessions/{id}/options"), Some(json!({
            "count": 3,
            "aspect_ratio": {"kind": "landscape"}
        }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 3);

        let (status, body) = call(&app, "POST", &format!("/api/sessions/{id}/generate"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"]["state"], "result");
        assert_eq!(body["phase"]["images"].as_array().unwrap().len(), 3);
        assert_eq!(body["history"].as_array().unwrap().len(), 1);
        assert_eq!(generator.calls(), 3);

        let request = Request::get(format!("/api/sessions/{id}/results/2/download")).body(Body::empty()).unwrap();
        let (status, headers, bytes) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_DISPOSITION], "attachment; filename=\"generated-image-2.png\"");
        assert_eq!(headers[header::CONTENT_TYPE], "image/png");
        assert_eq!(bytes.as_ref(), b"img1");
        assert_eq!(encoded(1), "aW1nMQ==");

        let (status, _) = call(&app, "GET", &format!("/api/sessions/{id}/results/4/download"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn validation_failure_is_reported_in_the_session() {
        let generator = Arc::new(FakeGenerator::default());
        let app = app(generator.clone());
        let id = new_session(&app).await;

        let (status, body) = call(&app, "POST", &format!("/api/sessions/{id}/generate"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"]["state"], "idle");
        assert_eq!(body["phase"]["error"], "Please upload both a character image and a product image.");
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn failing_request_empties_the_batch() {
        let app = app(Arc::new(FakeGenerator::failing_on(1)));
        let id = new_session(&app).await;
        call(&app, "PUT", &format!("/api/sessions/{id}/mode"), Some(json!({"mode": "product"}))).await;
        call(&app, "PUT", &format!("/api/sessions/{id}/images/product"), Some(json!({"data_url": PNG_URL}))).await;
        call(&app, "PUT", &format!("/api/sessions/{id}/options"), Some(json!({"instruction": "a marble counter", "count": 2}))).await;

        let (status, body) = call(&app, "POST", &format!("/api/sessions/{id}/generate"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"]["state"], "idle");
        assert!(body["phase"]["error"].as_str().unwrap().contains("model declined"));
        assert_eq!(body["history"], json!([]));
    }

    #[tokio::test]
    async fn upload_encodes_file_as_data_url() {
        let app = app(Arc::new(FakeGenerator::default()));
        let id = new_session(&app).await;

        let png: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
        let mut form = Vec::new();
        form.extend_from_slice(b"--XBOUNDARY\r\nContent-Disposition: form-data; name=\"file\"; filename=\"me.png\"\r\nContent-Type: application/octet-stream\r\n\r\n");
        form.extend_from_slice(png);
        form.extend_from_slice(b"\r\n--XBOUNDARY--\r\n");
        let request = Request::post(format!("/api/sessions/{id}/images/character/upload"))
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
            .body(Body::from(form))
            .unwrap();

        let (status, _, bytes) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["images"]["character"].as_str().unwrap().starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn upload_skips_text_fields_before_the_file() {
        let app = app(Arc::new(FakeGenerator::default()));
        let id = new_session(&app).await;

        let jpeg: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 16, b'J', b'F', b'I', b'F'];
        let mut form = Vec::new();
        form.extend_from_slice(b"--XBOUNDARY\r\nContent-Disposition: form-data; name=\"caption\"\r\n\r\nmy product\r\n");
        form.extend_from_slice(b"--XBOUNDARY\r\nContent-Disposition: form-data; name=\"file\"; filename=\"bottle.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n");
        form.extend_from_slice(jpeg);
        form.extend_from_slice(b"\r\n--XBOUNDARY--\r\n");
        let request = Request::post(format!("/api/sessions/{id}/images/product/upload"))
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
            .body(Body::from(form))
            .unwrap();

        let (status, _, bytes) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["images"]["product"].as_str().unwrap().starts_with("data:image/jpeg;base64,"));
    }

    #[tokio::test]
    async fn dropped_generate_request_still_settles_the_session() {
        let state = AppState::new(Arc::new(FakeGenerator::default()));
        let app = router(state.clone(), 1024 * 1024);
        let id = new_session(&app).await;
        for slot in ["character", "product"] {
            call(&app, "PUT", &format!("/api/sessions/{id}/images/{slot}"), Some(json!({"data_url": PNG_URL}))).await;
        }

        // Poll the handler once so the batch starts, then drop it like a closed tab.
        let request = Request::post(format!("/api/sessions/{id}/generate")).body(Body::empty()).unwrap();
        assert!(app.clone().oneshot(request).now_or_never().is_none());

        let session: Uuid = id.parse().unwrap();
        for _ in 0..1000 {
            let loading = state.store.read().get(&session).map(Studio::is_loading).unwrap_or(false);
            if !loading {
                break;
            }
            tokio::task::yield_now().await;
        }

        let (status, body) = call(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"]["state"], "result");
        assert_eq!(body["history"].as_array().unwrap().len(), 1);
        let (status, _) = call(&app, "PUT", &format!("/api/sessions/{id}/mode"), Some(json!({"mode": "product"}))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn errors_map_to_statuses() {
        let app = app(Arc::new(FakeGenerator::default()));
        let id = new_session(&app).await;

        let (status, _) = call(&app, "GET", &format!("/api/sessions/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "PUT", &format!("/api/sessions/{id}/images/hat"), Some(json!({"data_url": PNG_URL}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = call(&app, "PUT", &format!("/api/sessions/{id}/options"), Some(json!({"count": 9}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "image count must be between 1 and 6, got 9");
        let (status, _) = call(&app, "PUT", &format!("/api/sessions/{id}/images/product"), Some(json!({"data_url": "not a url"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let (status, _) = call(&app, "POST", &format!("/api/sessions/{id}/history/0/restore"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "POST", &format!("/api/sessions/{id}/regenerate"), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(&app, "DELETE", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_over_keeps_history_and_restore_brings_it_back() {
        let app = app(Arc::new(FakeGenerator::default()));
        let id = new_session(&app).await;
        for slot in ["character", "product", "outfit"] {
            call(&app, "PUT", &format!("/api/sessions/{id}/images/{slot}"), Some(json!({"data_url": PNG_URL}))).await;
        }
        call(&app, "POST", &format!("/api/sessions/{id}/generate"), None).await;

        let (_, body) = call(&app, "POST", &format!("/api/sessions/{id}/start-over"), None).await;
        assert_eq!(body["images"], json!({}));
        assert_eq!(body["history"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "POST", &format!("/api/sessions/{id}/history/0/restore"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"]["state"], "result");
        assert_eq!(body["images"]["outfit"], PNG_URL);

        let (_, body) = call(&app, "POST", &format!("/api/sessions/{id}/continue"), None).await;
        assert_eq!(body["phase"]["state"], "idle");
        assert_eq!(body["images"].as_object().unwrap().len(), 3);
    }
}
