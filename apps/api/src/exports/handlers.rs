use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::exports::service::{ExportStatusView, ExportTicket, QueuedEmail};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct CreateExportRequest {
    pub user_id: Uuid,
    pub resume_id: Uuid,
}

#[derive(Deserialize)]
pub struct BulkApplyRequest {
    pub user_id: Uuid,
    pub recipient: String,
}

#[derive(Deserialize)]
pub struct UserRequest {
    pub user_id: Uuid,
}

/// POST /api/v1/exports
pub async fn handle_create_export(
    State(state): State<AppState>,
    Json(req): Json<CreateExportRequest>,
) -> Result<(StatusCode, Json<ExportTicket>), AppError> {
    let ticket = state
        .exports
        .enqueue_export(req.user_id, req.resume_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

/// GET /api/v1/exports/:id
pub async fn handle_get_export(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<ExportStatusView>, AppError> {
    Ok(Json(state.exports.get_status(params.user_id, id).await?))
}

/// POST /api/v1/exports/:id/apply
pub async fn handle_bulk_apply(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<BulkApplyRequest>,
) -> Result<(StatusCode, Json<QueuedEmail>), AppError> {
    let queued = state
        .exports
        .enqueue_bulk_apply(req.user_id, id, &req.recipient)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(queued)))
}

/// POST /api/v1/exports/emails/:log_id/retry
pub async fn handle_retry_email(
    State(state): State<AppState>,
    Path(log_id): Path<Uuid>,
    Json(req): Json<UserRequest>,
) -> Result<(StatusCode, Json<QueuedEmail>), AppError> {
    let queued = state
        .exports
        .retry_failed_email(req.user_id, log_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(queued)))
}
