use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::billing::service::WebhookOutcome;
use crate::errors::AppError;
use crate::models::billing::Provider;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ReplayRequest {
    pub user_id: Uuid,
}

/// POST /api/v1/billing/webhooks/:provider
///
/// Takes the raw body so the signature is checked over the exact bytes sent.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, AppError> {
    let provider = Provider::parse(&provider)
        .ok_or_else(|| AppError::NotFound(format!("Unknown billing provider '{provider}'")))?;
    let signature = headers
        .get(provider.signature_header())
        .and_then(|value| value.to_str().ok());

    let outcome = state.billing.handle(provider, signature, &body).await?;
    Ok(Json(outcome))
}

/// POST /api/v1/billing/webhooks/events/:id/replay
pub async fn handle_replay(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReplayRequest>,
) -> Result<Json<WebhookOutcome>, AppError> {
    Ok(Json(state.billing.replay(req.user_id, id).await?))
}
