//! HTTP facade: start a job, poll its progress, fetch the finished file.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State, rejection::JsonRejection},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};
use url::Url;

use crate::{
    jobs::JobId,
    naming,
    quality::Quality,
    worker::{self, WorkerContext},
};

#[derive(Clone)]
pub struct AppState {
    pub worker: WorkerContext,
    pub cleanup_delay: Duration,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Plain-text 400 returned for any file request that cannot be served yet.
struct FileNotReady;

impl IntoResponse for FileNotReady {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, "File not ready").into_response()
    }
}

#[derive(Debug, Deserialize)]
struct StartDownloadRequest {
    url: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartDownloadResponse {
    job_id: JobId,
}

#[derive(Debug, Deserialize)]
struct JobQuery {
    job_id: Option<String>,
}

impl JobQuery {
    fn id(&self) -> Option<JobId> {
        self.job_id.as_deref()?.trim().parse().ok()
    }
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    percent: i32,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/start-download", post(start_download))
        .route("/progress", get(progress))
        .route("/get-file", get(get_file))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Any origin when `allowed_origins` is empty, otherwise an exact allow-list.
pub fn build_cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let allow_origin = if allowed_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let origins = allowed_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin.trim_end_matches('/'))
                    .with_context(|| format!("invalid origin in ALLOWED_ORIGINS: {origin}"))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([header::CONTENT_DISPOSITION]))
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<StartDownloadRequest>, JsonRejection>,
) -> ApiResult<Json<StartDownloadResponse>> {
    let Json(request) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

    let url = request
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("No URL provided"))?;
    validate_url(url)?;

    let quality = request
        .quality
        .as_deref()
        .map(Quality::parse)
        .unwrap_or_default();

    let id = state.worker.registry.create();
    info!(job_id = %id, %url, quality = quality.as_str(), "started download job");
    worker::spawn_download(state.worker.clone(), id, url.to_string(), quality);

    Ok(Json(StartDownloadResponse { job_id: id }))
}

/// Only absolute http(s) URLs reach yt-dlp; anything else could be read as a
/// local path or an option.
fn validate_url(raw: &str) -> ApiResult<()> {
    let parsed = Url::parse(raw).map_err(|_| ApiError::bad_request("Invalid URL"))?;
    let web_scheme = matches!(parsed.scheme(), "http" | "https");
    if !web_scheme || parsed.host_str().is_none() {
        return Err(ApiError::bad_request("Invalid URL"));
    }
    Ok(())
}

async fn progress(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Json<ProgressResponse> {
    let snapshot = query.id().and_then(|id| state.worker.registry.snapshot(id));
    let response = match snapshot {
        Some(snapshot) => ProgressResponse {
            percent: snapshot.reported_percent(),
            status: snapshot.status.as_str(),
            error: snapshot.error,
        },
        None => ProgressResponse {
            percent: 0,
            status: "unknown",
            error: None,
        },
    };
    Json(response)
}

async fn get_file(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Result<Response, FileNotReady> {
    let id = query.id().ok_or(FileNotReady)?;
    let path = state.worker.registry.ready_file(id).ok_or_else(|| {
        debug!(job_id = %id, "file requested before it was ready");
        FileNotReady
    })?;

    let file = File::open(&path).await.map_err(|err| {
        debug!(job_id = %id, path = %path.display(), error = %err, "file vanished");
        FileNotReady
    })?;
    let length = file.metadata().await.ok().map(|meta| meta.len());

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download.bin".to_string());
    let mime = MimeGuess::from_path(&path).first_or_octet_stream();

    info!(job_id = %id, %filename, "serving file");
    schedule_cleanup(&state, id);

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&naming::content_disposition(&filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(response)
}

/// Deletes the job directory a little after the first successful fetch. The
/// open file handle keeps streaming even after the unlink.
fn schedule_cleanup(state: &AppState, id: JobId) {
    if !state.worker.registry.schedule_release(id) {
        return;
    }
    let ctx = state.worker.clone();
    let delay = state.cleanup_delay;
    state.worker.tracker.spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.shutdown.cancelled() => {}
        }
        worker::remove_job_dir(&ctx.job_dir(id)).await;
        ctx.registry.release_file(id);
        debug!(job_id = %id, "released served file");
    });
}
