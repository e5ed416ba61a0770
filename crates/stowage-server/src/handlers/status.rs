use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;

use stowage_types::FileId;

use crate::error::ApiError;
use crate::state::AppState;

/// GET /files/{id}/status — progress of the session that owns this file.
pub async fn by_file_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let file_id = FileId::parse(&id)?;
    let status = state.inner.service.status_by_file_id(file_id).await?;
    Ok(Json(status).into_response())
}

/// GET /status/{idempotency_key} — progress by the client's own key.
pub async fn by_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let status = state.inner.service.status_by_key(&key).await?;
    Ok(Json(status).into_response())
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::super::test_helpers::*;

    #[tokio::test]
    async fn status_reaches_completed_with_full_progress() {
        let (router, service) = setup_app().await;

        let resp = multipart_upload(
            router.clone(),
            "status-key-1",
            "s.txt",
            "text/plain",
            &[1u8; 64],
            &[],
        )
        .await;
        let file_id = json_body(resp).await["file_id"].as_str().unwrap().to_string();
        wait_completed(&service, "status-key-1").await;

        let resp = authed_get(router.clone(), &format!("/files/{file_id}/status")).await;
        assert_status(&resp, StatusCode::OK);
        let status = json_body(resp).await;
        assert_eq!(status["status"], "completed");
        assert_eq!(status["completed"], true);
        assert_eq!(status["progress"]["remaining_chunks"], 0);
        assert_eq!(
            status["progress"]["chunks_uploaded"],
            status["progress"]["total_chunks"]
        );

        // The idempotency-key route reports the same session.
        let resp = authed_get(router, "/status/status-key-1").await;
        assert_status(&resp, StatusCode::OK);
        let by_key = json_body(resp).await;
        assert_eq!(by_key["file_id"], file_id.as_str());
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let (router, _service) = setup_app().await;
        let resp = authed_get(router, "/status/never-seen-key").await;
        assert_status(&resp, StatusCode::NOT_FOUND);
        let body = json_body(resp).await;
        assert_eq!(body["code"], "SESSION_NOT_FOUND");
    }
}
