pub mod files;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::billing::handlers as billing;
use crate::exports::handlers as exports;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Exports
        .route("/api/v1/exports", post(exports::handle_create_export))
        .route("/api/v1/exports/:id", get(exports::handle_get_export))
        .route("/api/v1/exports/:id/apply", post(exports::handle_bulk_apply))
        .route(
            "/api/v1/exports/emails/:log_id/retry",
            post(exports::handle_retry_email),
        )
        // Billing
        .route(
            "/api/v1/billing/webhooks/:provider",
            post(billing::handle_webhook),
        )
        .route(
            "/api/v1/billing/webhooks/events/:id/replay",
            post(billing::handle_replay),
        )
        // Local storage downloads
        .route("/files/*key", get(files::handle_download))
        .with_state(state)
}
