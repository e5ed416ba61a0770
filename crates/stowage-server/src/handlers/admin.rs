use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};

use crate::error::ApiError;
use crate::state::{AppState, RequestContext};

/// GET /quota — the calling user's current usage.
pub async fn quota(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
) -> Result<Response, ApiError> {
    let status = state.inner.service.quota_status(&context.user_id).await;
    Ok(Json(status).into_response())
}

/// GET /health — always 200; degradation is reported in the body so
/// orchestrators treat reachability and correctness separately.
pub async fn health(State(state): State<AppState>) -> Response {
    let snapshot = state.inner.service.health().await;
    Json(snapshot).into_response()
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::super::test_helpers::*;

    #[tokio::test]
    async fn quota_reflects_committed_usage() {
        let (router, service) = setup_app().await;

        let resp = multipart_upload(
            router.clone(),
            "quota-view-1",
            "q.txt",
            "text/plain",
            &[5u8; 256],
            &[],
        )
        .await;
        assert_status(&resp, StatusCode::OK);
        wait_completed(&service, "quota-view-1").await;

        let resp = authed_get(router, "/quota").await;
        assert_status(&resp, StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["used_bytes"], 256);
        assert_eq!(body["uploads_today"], 1);
        assert!(body["max_bytes"].as_u64().unwrap() > 0);
        assert!(body["usage_percentage"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn health_reports_component_status() {
        let (router, _service) = setup_app().await;
        let resp = get_no_auth(router, "/health").await;
        assert_status(&resp, StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["services"]["ledger"], "up");
        assert_eq!(body["services"]["cache"], "up");
        assert!(body["timestamp"].is_string());
    }
}
