//! API endpoint handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use markup_log::info;
use markup_queue::{CleanReport, Job, JobCounts, JobId, JobState, JobSummary, Submission};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use crate::AppState;
use crate::error::ServerError;

/// Page size when `end` is not given.
const DEFAULT_PAGE: usize = 50;

/// Grace period for `POST /clean` when `graceMs` is not given.
const DEFAULT_CLEAN_GRACE: Duration = Duration::from_secs(3600);

type ApiResult<T> = Result<T, ServerError>;

/// Body of `POST /jobs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub url: String,
    #[serde(default)]
    pub options: Option<Value>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

/// Range parameters for job listings.
#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanParams {
    pub grace_ms: Option<u64>,
}

/// Health check endpoint.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Schedule a sync of `url`, debouncing earlier submissions for it.
pub async fn submit_job(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Submission>)> {
    let Json(request) = body.map_err(|e| ServerError::BadRequest(e.body_text()))?;

    let url = request.url.trim();
    url::Url::parse(url)
        .map_err(|e| ServerError::BadRequest(format!("invalid url {url:?}: {e}")))?;

    let options = request.options.unwrap_or_else(|| json!({}));
    let payload = json!({ "url": url, "options": options });
    let delay = request.delay_ms.map(Duration::from_millis);

    let submission = state.queue.submit_with_delay(url, payload, delay).await?;
    info!(job_id = %submission.job_id, url, run_at = %submission.will_run_at, "Job scheduled");
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<JobCounts>> {
    Ok(Json(state.queue.stats().await?))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let id = parse_id(&id)?;
    let job = state
        .queue
        .get_job(id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Job not found: {id}")))?;
    Ok(Json(job))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Path(job_state): Path<String>,
    Query(range): Query<RangeParams>,
) -> ApiResult<Json<Vec<JobSummary>>> {
    let job_state: JobState = job_state.parse()?;
    let start = range.start.unwrap_or(0);
    let end = range
        .end
        .unwrap_or_else(|| start.saturating_add(DEFAULT_PAGE - 1));
    if end < start {
        return Err(ServerError::BadRequest(format!(
            "end ({end}) must not be before start ({start})"
        )));
    }
    Ok(Json(state.queue.list_jobs(job_state, start, end).await?))
}

/// Make a job eligible immediately.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobSummary>> {
    let job = state.queue.retry_now(parse_id(&id)?).await?;
    Ok(Json(job.summary()))
}

pub async fn remove_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = state.queue.remove(parse_id(&id)?).await?;
    Ok(Json(json!({ "jobId": job.id, "removed": true, "state": job.state })))
}

pub async fn pause(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.queue.pause().await?;
    Ok(Json(json!({ "paused": true })))
}

pub async fn resume(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.queue.resume().await?;
    Ok(Json(json!({ "paused": false })))
}

/// Remove terminal jobs older than `graceMs`.
pub async fn clean(
    State(state): State<AppState>,
    Query(params): Query<CleanParams>,
) -> ApiResult<Json<CleanReport>> {
    let grace = params
        .grace_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_CLEAN_GRACE);
    Ok(Json(state.queue.clean(grace).await?))
}

/// Unparseable ids cannot name a job.
fn parse_id(raw: &str) -> ApiResult<JobId> {
    raw.parse()
        .map_err(|_| ServerError::NotFound(format!("Job not found: {raw}")))
}
