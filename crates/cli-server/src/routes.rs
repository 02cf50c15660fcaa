use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use tubegrab::{
    protocol::DeliveredFile,
    ratelimit::{client_key, RateLimiter},
    validation::parse_search_query,
    DownloadService, FetchError, Job, MediaFetcher, ResultOutcome, SearchProvider, SearchResult,
    ValidationError, VideoId, VideoInfo,
};

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub service: DownloadService,
    pub search: Arc<dyn SearchProvider>,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/search", get(search))
        .route("/video/{video_id}", get(video_info))
        .route("/download", post(create_download))
        .route("/download/{job_id}/progress", get(download_progress))
        .route("/download/{job_id}", get(download_result))
        .route("/downloads", get(list_downloads))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn too_many_requests(retry_after: Duration) -> Self {
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "Too many requests. Please try again later.".to_string(),
            retry_after: Some(secs.max(1)),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        error!("Request failed: {}", err);
        ApiError::internal(err.user_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn enforce_rate_limit(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let key = client_key(
        header_str(headers, "x-forwarded-for"),
        header_str(headers, "x-real-ip"),
    );
    state.limiter.check(&key).map_err(|retry_after| {
        warn!("Rate limit exceeded for {}", key);
        ApiError::too_many_requests(retry_after)
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    q: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    videos: Vec<SearchResult>,
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    enforce_rate_limit(&state, &headers)?;
    let query = parse_search_query(params.q.as_deref().unwrap_or_default())?;
    let videos = state.search.search(&query).await?;
    Ok(Json(SearchResponse { videos }))
}

async fn video_info(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<VideoInfo>> {
    let video_id = VideoId::parse(&video_id)?;
    let info = state
        .service
        .registry()
        .fetcher()
        .get_video_info(&video_id)
        .await?;
    Ok(Json(info))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateDownloadBody {
    video_id: String,
    format: String,
    quality: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDownloadResponse {
    job_id: String,
}

async fn create_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreateDownloadBody>, JsonRejection>,
) -> ApiResult<Json<CreateDownloadResponse>> {
    enforce_rate_limit(&state, &headers)?;
    let Json(body) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let job_id = state
        .service
        .create(&body.video_id, &body.format, &body.quality)?;
    Ok(Json(CreateDownloadResponse {
        job_id: job_id.to_string(),
    }))
}

async fn download_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Job>> {
    state
        .service
        .status(&job_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Download not found"))
}

async fn download_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let outcome = state
        .service
        .result(&job_id)
        .await
        .map_err(|e| {
            error!("Failed to deliver {}: {}", job_id, e);
            ApiError::internal("Failed to read downloaded file")
        })?;

    match outcome {
        ResultOutcome::NotFound => Err(ApiError::not_found("Download not found")),
        ResultOutcome::InProgress(job) | ResultOutcome::Failed(job) => Ok(Json(job).into_response()),
        ResultOutcome::Completed(file) => file_response(file),
    }
}

async fn list_downloads(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.service.jobs())
}

fn file_response(file: DeliveredFile) -> ApiResult<Response> {
    let disposition = HeaderValue::from_str(&content_disposition(&file.file_name))
        .map_err(|e| ApiError::internal(format!("Invalid file name: {}", e)))?;
    let length = file.bytes.len();

    let mut response = Response::new(Body::from(file.bytes));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(file.content_type));
    headers.insert(CONTENT_DISPOSITION, disposition);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

/// `attachment` disposition with an ASCII fallback name and the exact
/// UTF-8 name in `filename*`
pub fn content_disposition(file_name: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_file_name(file_name),
        urlencoding::encode(file_name)
    )
}

fn ascii_file_name(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = replaced.trim();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}
