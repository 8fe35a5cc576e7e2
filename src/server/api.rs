use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::error;
use twinfix_common::envelope::RefreshHint;
use twinfix_common::models::NewComment;
use twinfix_common::{Actor, Event, IssuePatch, IssueStatus, NewIssue, ScheduleStatus};

use crate::errors::TrackerError;
use crate::events::Broadcaster;
use crate::hub::Hub;
use crate::lifecycle::{IssueLifecycle, ScheduleChange};
use crate::store::{BroadcastingStore, IssueStore, SqliteStore};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    /// Broadcasting store: every write through it is announced.
    pub store: Arc<dyn IssueStore>,
    pub lifecycle: Arc<IssueLifecycle>,
    pub broadcaster: Broadcaster,
    /// Cancelled on server shutdown; every socket loop watches a child token.
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(sqlite: SqliteStore, broadcaster: Broadcaster, max_commit_attempts: u32) -> Self {
        let store: Arc<dyn IssueStore> = Arc::new(BroadcastingStore::new(sqlite, broadcaster.clone()));
        let lifecycle = IssueLifecycle::new(Arc::clone(&store)).with_max_attempts(max_commit_attempts);
        Self {
            store,
            lifecycle: Arc::new(lifecycle),
            broadcaster,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        self.broadcaster.hub()
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub status: String,
    pub changed_by_id: Option<i64>,
    pub changed_by_name: Option<String>,
    pub notes: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub scheduled_date: DateTime<Utc>,
    pub changed_by_id: Option<i64>,
    pub changed_by_name: Option<String>,
    pub notes: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdateRequest {
    pub scheduled_date: Option<DateTime<Utc>>,
    pub schedule_status: String,
    pub changed_by_id: Option<i64>,
    pub changed_by_name: Option<String>,
    pub notes: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub final_cost: Option<f64>,
    pub changed_by_id: Option<i64>,
    pub changed_by_name: Option<String>,
    pub notes: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRequest {
    pub user_id: Option<i64>,
    pub username: String,
    pub content: String,
}

fn actor(id: Option<i64>, name: Option<String>) -> Actor {
    Actor { id, name }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::IssueNotFound { .. } | TrackerError::ClientNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            TrackerError::InvalidState(_) | TrackerError::Conflict { .. } => {
                ApiError::Conflict(err.to_string())
            }
            TrackerError::Validation(_) => ApiError::BadRequest(err.to_string()),
            TrackerError::TransientIo { .. } | TrackerError::Store(_) => {
                error!(error = %err, "Request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        TrackerError::Store(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/issues", get(list_issues).post(create_issue))
        .route("/api/issues/by-status/{status}", get(issues_by_status))
        .route(
            "/api/issues/{id}",
            get(get_issue).patch(update_issue).delete(delete_issue),
        )
        .route("/api/issues/{id}/status", patch(change_status))
        .route("/api/issues/{id}/history", get(status_history))
        .route("/api/issues/{id}/comments", get(list_comments).post(add_comment))
        .route(
            "/api/issues/{id}/schedule",
            post(schedule_repair).patch(update_schedule),
        )
        .route("/api/issues/{id}/complete", post(complete_repair))
        .route("/api/issues/{id}/schedule-history", get(schedule_history))
        .route("/api/statistics", get(statistics))
        .route("/api/ws/clients", get(connected_clients))
        .route("/api/refresh", post(request_refresh))
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn require_issue(state: &SharedState, id: i64) -> Result<(), ApiError> {
    match state.store.get_issue(id).await? {
        Some(_) => Ok(()),
        None => Err(TrackerError::IssueNotFound { id }.into()),
    }
}

fn parse_status<T: FromStr<Err = String>>(value: &str) -> Result<T, ApiError> {
    T::from_str(value).map_err(|e| TrackerError::InvalidState(e).into())
}

/// Status used to narrow a read. Unknown values are a bad request, not a
/// state error.
fn parse_filter(value: &str) -> Result<IssueStatus, ApiError> {
    value.parse().map_err(ApiError::BadRequest)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_issues(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query.status.as_deref().map(parse_filter).transpose()?;
    Ok(Json(state.store.list_issues(status).await?))
}

async fn issues_by_status(
    State(state): State<SharedState>,
    Path(status): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = parse_filter(&status)?;
    Ok(Json(state.store.list_issues(Some(status)).await?))
}

async fn statistics(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.issue_statistics().await?))
}

async fn create_issue(
    State(state): State<SharedState>,
    Json(req): Json<NewIssue>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title is required".into()));
    }
    let issue = state.store.create_issue(req).await?;
    Ok((StatusCode::CREATED, Json(issue)))
}

async fn get_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = state
        .store
        .get_issue(id)
        .await?
        .ok_or(TrackerError::IssueNotFound { id })?;
    Ok(Json(issue))
}

async fn update_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(patch): Json<IssuePatch>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = state
        .store
        .update_issue(id, patch)
        .await?
        .ok_or(TrackerError::IssueNotFound { id })?;
    Ok(Json(issue))
}

async fn delete_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.delete_issue(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TrackerError::IssueNotFound { id }.into())
    }
}

async fn change_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status: IssueStatus = parse_status(&req.status)?;
    let issue = state
        .lifecycle
        .transition(id, status, actor(req.changed_by_id, req.changed_by_name), req.notes)
        .await?;
    Ok(Json(issue))
}

async fn status_history(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_issue(&state, id).await?;
    Ok(Json(state.store.get_status_history(id).await?))
}

async fn list_comments(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_issue(&state, id).await?;
    Ok(Json(state.store.list_comments(id).await?))
}

async fn add_comment(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content is required".into()));
    }
    require_issue(&state, id).await?;
    let comment = state
        .store
        .create_comment(NewComment {
            issue_id: id,
            user_id: req.user_id,
            username: req.username,
            content: req.content,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn schedule_repair(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = state
        .lifecycle
        .schedule_repair(
            id,
            req.scheduled_date,
            actor(req.changed_by_id, req.changed_by_name),
            req.notes,
        )
        .await?;
    Ok(Json(issue))
}

async fn update_schedule(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ScheduleUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status: ScheduleStatus = parse_status(&req.schedule_status)?;
    let change = ScheduleChange {
        date: req.scheduled_date,
        status,
    };
    let issue = state
        .lifecycle
        .update_repair_schedule(id, change, actor(req.changed_by_id, req.changed_by_name), req.notes)
        .await?;
    Ok(Json(issue))
}

async fn complete_repair(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CompleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = state
        .lifecycle
        .mark_repair_completed(
            id,
            actor(req.changed_by_id, req.changed_by_name),
            req.final_cost,
            req.notes,
        )
        .await?;
    Ok(Json(issue))
}

async fn schedule_history(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_issue(&state, id).await?;
    Ok(Json(state.store.get_repair_schedule_history(id).await?))
}

async fn connected_clients(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.hub().clients())
}

/// Ask every client to re-fetch. The body is optional.
async fn request_refresh(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let hint: RefreshHint = if body.is_empty() {
        RefreshHint::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let report = state.broadcaster.publish(Event::DataRefresh(hint), None);
    Ok(Json(serde_json::json!({"delivered": report.delivered.len()})))
}

// ── Tests ─────────────────────────────────────────────────────────────
