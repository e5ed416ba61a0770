use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use stowage_core::config::{LimitsSection, StowageConfig};
use stowage_core::session::SessionStatus;
use stowage_core::Stowage;

use crate::config::ServerSection;
use crate::state::AppState;

pub const TEST_TOKEN: &str = "test-token";

const BOUNDARY: &str = "stowage-test-boundary";

/// Wired-up router and service over the in-memory ledger, with a small
/// chunk size so tiny test payloads still span several chunks.
pub async fn setup_app() -> (Router, Arc<Stowage>) {
    let mut core = StowageConfig::default();
    core.limits = LimitsSection {
        chunk_size: 16,
        ..LimitsSection::default()
    };
    core.ledger.batch_size = 2;
    let max_body = (core.limits.max_file_size * 2) as usize;

    let service = Stowage::new(core).await.expect("build service");

    let config = ServerSection {
        token: TEST_TOKEN.to_string(),
        ..Default::default()
    };
    let state = AppState::new(config, service.clone());
    (super::router(state, max_body), service)
}

pub async fn send(router: Router, req: Request<Body>) -> axum::response::Response {
    router.oneshot(req).await.unwrap()
}

pub async fn authed_get(router: Router, path: &str) -> axum::response::Response {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .header("Authorization", format!("Bearer {TEST_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    send(router, req).await
}

pub async fn get_no_auth(router: Router, path: &str) -> axum::response::Response {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    send(router, req).await
}

fn multipart_body(filename: &str, content_type: &str, bytes: &[u8], owner: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
             filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(b"\r\n");
    if let Some(owner) = owner {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"owner\"\r\n\r\n{owner}\r\n")
                .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(
    idempotency_key: Option<&str>,
    body: Vec<u8>,
    extra_headers: &[(&str, &str)],
) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/files")
        .header("Authorization", format!("Bearer {TEST_TOKEN}"))
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(key) = idempotency_key {
        builder = builder.header("Idempotency-Key", key);
    }
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body)).unwrap()
}

pub async fn multipart_upload(
    router: Router,
    idempotency_key: &str,
    filename: &str,
    content_type: &str,
    bytes: &[u8],
    extra_headers: &[(&str, &str)],
) -> axum::response::Response {
    let body = multipart_body(filename, content_type, bytes, None);
    send(router, upload_request(Some(idempotency_key), body, extra_headers)).await
}

pub async fn multipart_upload_with_owner(
    router: Router,
    idempotency_key: &str,
    filename: &str,
    content_type: &str,
    bytes: &[u8],
    owner: &str,
) -> axum::response::Response {
    let body = multipart_body(filename, content_type, bytes, Some(owner));
    send(router, upload_request(Some(idempotency_key), body, &[])).await
}

pub async fn multipart_upload_no_key(
    router: Router,
    filename: &str,
    content_type: &str,
    bytes: &[u8],
) -> axum::response::Response {
    let body = multipart_body(filename, content_type, bytes, None);
    send(router, upload_request(None, body, &[])).await
}

/// Poll until the session behind `idempotency_key` completes.
pub async fn wait_completed(service: &Stowage, idempotency_key: &str) {
    for _ in 0..400 {
        let status = service.status_by_key(idempotency_key).await.unwrap();
        if status.completed {
            return;
        }
        assert_eq!(
            status.status,
            SessionStatus::Uploading,
            "session '{idempotency_key}' failed: {:?}",
            status.error
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session '{idempotency_key}' never completed");
}

pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("collect body")
        .to_vec()
}

pub async fn json_body(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

pub fn assert_status(response: &axum::response::Response, expected: StatusCode) {
    assert_eq!(
        response.status(),
        expected,
        "expected {expected}, got {}",
        response.status()
    );
}
