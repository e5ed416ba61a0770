pub mod admin;
pub mod files;
pub mod query;
pub mod status;

#[cfg(test)]
pub mod test_helpers;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use crate::state::{AppState, RequestContext};

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    let authed = Router::new()
        .route("/files", axum::routing::post(files::upload))
        .route("/files/by-owner/{owner}", axum::routing::get(query::by_owner))
        .route(
            "/files/by-extension/{extension}",
            axum::routing::get(query::by_extension),
        )
        .route(
            "/files/by-type/{*content_type}",
            axum::routing::get(query::by_content_type),
        )
        .route("/files/{id}", axum::routing::get(files::download))
        .route("/files/{id}/info", axum::routing::get(files::info))
        .route("/files/{id}/entities", axum::routing::get(files::entities))
        .route("/files/{id}/status", axum::routing::get(status::by_file_id))
        .route("/status/{key}", axum::routing::get(status::by_key))
        .route("/quota", axum::routing::get(admin::quota))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(DefaultBodyLimit::max(max_body_bytes));

    // Health endpoint is unauthenticated.
    let public = Router::new().route("/health", axum::routing::get(admin::health));

    public
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Verify the bearer token and attach the upstream identity to the request.
///
/// Token verification proper happens upstream; this layer checks the shared
/// service token and consumes the identity headers the verifier sets.
async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let expected = state.inner.config.token.as_bytes();

    let provided = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if !bool::from(provided.as_bytes().ct_eq(expected)) {
        return (StatusCode::UNAUTHORIZED, "invalid or missing token").into_response();
    }

    let context = context_from_headers(req.headers());
    req.extensions_mut().insert(context);
    next.run(req).await
}

fn context_from_headers(headers: &axum::http::HeaderMap) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    RequestContext {
        user_id: header("X-User-Id").unwrap_or_else(|| "anonymous".to_string()),
        role: header("X-User-Role").unwrap_or_else(|| "user".to_string()),
        permissions: header("X-User-Permissions")
            .map(|v| v.split(',').map(|p| p.trim().to_string()).collect())
            .unwrap_or_default(),
        api_key: header("X-API-Key"),
    }
}
