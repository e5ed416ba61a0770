use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::ApiError;
use crate::state::AppState;

/// GET /files/by-owner/{owner}
pub async fn by_owner(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Response, ApiError> {
    let files = state.inner.service.files_by_owner(&owner).await?;
    Ok(Json(serde_json::json!({
        "owner": owner,
        "count": files.len(),
        "files": files,
    }))
    .into_response())
}

/// GET /files/by-extension/{extension}
pub async fn by_extension(
    State(state): State<AppState>,
    Path(extension): Path<String>,
) -> Result<Response, ApiError> {
    let files = state.inner.service.files_by_extension(&extension).await?;
    Ok(Json(serde_json::json!({
        "extension": extension,
        "count": files.len(),
        "files": files,
    }))
    .into_response())
}

/// GET /files/by-type/{content_type} — wildcard path because MIME types
/// contain a slash.
pub async fn by_content_type(
    State(state): State<AppState>,
    Path(content_type): Path<String>,
) -> Result<Response, ApiError> {
    let files = state.inner.service.files_by_content_type(&content_type).await?;
    Ok(Json(serde_json::json!({
        "content_type": content_type,
        "count": files.len(),
        "files": files,
    }))
    .into_response())
}
