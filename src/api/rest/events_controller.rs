use crate::api::rest::{ApiError, ApiResult, AppState};
use crate::db::models::{ArchivedCopy, Event, EventCategory, EventFilter};
use crate::error::Error;
use crate::sync::{
    ArchivedFile, CameraStatus, LifecycleState, LocalDeletion, PresenceVector, RetentionPreview,
    SweepReport, SyncSummary,
};
use axum::body::StreamBody;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use log::info;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Event search parameters
#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    pub camera_id: Option<Uuid>,
    pub category: Option<EventCategory>,
    pub orphaned: Option<bool>,
    #[serde(default)]
    pub include_purged: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<EventQuery> for EventFilter {
    fn from(query: EventQuery) -> Self {
        EventFilter {
            camera_id: query.camera_id,
            category: query.category,
            orphaned: query.orphaned,
            include_purged: query.include_purged,
            limit: query.limit,
            offset: query.offset,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PresenceQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    pub camera_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub event_id: Uuid,
    pub presence: PresenceVector,
    pub state: Option<LifecycleState>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub event_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    /// False when a sweep was already running and this request was skipped
    pub ran: bool,
    pub report: Option<SweepReport>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/events", get(list_events))
        .route("/api/events/sync", post(trigger_sync))
        .route("/api/events/:id", get(get_event))
        .route("/api/events/:id/presence", get(get_presence))
        .route("/api/events/:id/download", get(download_event))
        .route("/api/events/:id/thumbnail", get(get_thumbnail))
        .route("/api/events/:id/ingest", post(ingest_event))
        .route("/api/events/:id/local", delete(delete_local))
        .route("/api/events/:id/device", delete(delete_from_device))
        .route("/api/retention/preview", get(retention_preview))
        .route("/api/retention/sweep", post(run_sweep))
        .route("/api/cameras/status", get(camera_status))
}

/// Stream an archive file with its content type
async fn serve_file(file: ArchivedFile, disposition: &str) -> ApiResult<Response> {
    let handle = tokio::fs::File::open(&file.path)
        .await
        .map_err(|e| ApiError::from(Error::from_io(&format!("open {}", file.path.display()), e)))?;
    let body = StreamBody::new(ReaderStream::new(handle));

    let headers = [
        (header::CONTENT_TYPE, file.content_type),
        (header::CONTENT_LENGTH, file.size.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("{}; filename=\"{}\"", disposition, file.file_name),
        ),
    ];
    Ok((StatusCode::OK, headers, body).into_response())
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Json<Vec<Event>>> {
    let events = state.engine.list_events(&query.into()).await?;
    Ok(Json(events))
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Event>> {
    Ok(Json(state.engine.get_event(&id).await?))
}

async fn get_presence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<PresenceQuery>,
) -> ApiResult<Json<PresenceResponse>> {
    let presence = state.engine.get_presence(&id, query.force).await?;
    let event = state.engine.get_event(&id).await?;
    Ok(Json(PresenceResponse {
        event_id: id,
        state: LifecycleState::from_presence(&presence, event.orphaned),
        presence,
    }))
}

async fn download_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let file = state.engine.archived_file(&id).await?;
    info!("Serving {} ({} bytes)", file.path.display(), file.size);
    serve_file(file, "attachment").await
}

async fn get_thumbnail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let file = state.engine.thumbnail_file(&id).await?;
    serve_file(file, "inline").await
}

async fn camera_status(State(state): State<AppState>) -> Json<Vec<CameraStatus>> {
    Json(state.engine.health().statuses())
}

async fn trigger_sync(
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Json<SyncSummary>> {
    info!("Sync requested for {:?}", query.camera_id);
    Ok(Json(state.engine.trigger_sync(query.camera_id).await?))
}

async fn ingest_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ArchivedCopy>> {
    Ok(Json(state.engine.ingest(&id).await?))
}

async fn delete_local(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LocalDeletion>> {
    Ok(Json(state.engine.request_delete_local(&id).await?))
}

async fn delete_from_device(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AckResponse>> {
    state.engine.request_delete_from_device(&id).await?;
    Ok(Json(AckResponse {
        event_id: id,
        status: "deleted_from_device".to_string(),
    }))
}

async fn retention_preview(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<RetentionPreview>>> {
    Ok(Json(state.engine.retention_preview().await?))
}

async fn run_sweep(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<SweepResponse>)> {
    match state.engine.run_retention_sweep().await? {
        Some(report) => Ok((
            StatusCode::OK,
            Json(SweepResponse {
                ran: true,
                report: Some(report),
            }),
        )),
        None => Ok((
            StatusCode::ACCEPTED,
            Json(SweepResponse {
                ran: false,
                report: None,
            }),
        )),
    }
}
