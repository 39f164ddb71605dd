use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;

use crate::errors::AppError;
use crate::state::AppState;
use crate::storage::{ObjectStorage, StorageError};

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub expires: i64,
    pub signature: String,
}

/// GET /files/*key
/// Serves locally stored exports behind the signed links `LocalDiskStorage` issues.
pub async fn handle_download(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let storage = state
        .local_files
        .as_ref()
        .ok_or_else(|| AppError::NotFound("File not found".to_string()))?;

    if !storage.verify_download(&key, params.expires, &params.signature, Utc::now().timestamp()) {
        return Err(AppError::Unauthorized(
            "Download link is invalid or expired".to_string(),
        ));
    }

    let bytes = storage.read_object(&key).await.map_err(|e| match e {
        StorageError::NotFound(_) => AppError::NotFound(format!("File {key} not found")),
        other => AppError::Storage(other),
    })?;
    let filename = key.rsplit('/').next().unwrap_or("export.pdf");

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}
