use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};

use stowage_core::ingest::UploadRequest;
use stowage_types::{FileId, StowageError};

use crate::error::ApiError;
use crate::state::{AppState, RequestContext};

/// POST /files — multipart upload. Admission is synchronous; ledger
/// persistence continues behind the returned `file_id`.
pub async fn upload(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError(StowageError::Validation(
                "Idempotency-Key header is required".into(),
            ))
        })?;

    let btl_days = match headers.get("BTL-Days") {
        Some(value) => {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .ok_or_else(|| {
                    ApiError(StowageError::Validation(
                        "BTL-Days must be a positive integer".into(),
                    ))
                })?;
            Some(parsed)
        }
        None => None,
    };

    let mut payload: Option<(Vec<u8>, String, String)> = None;
    let mut owner: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError(StowageError::Validation(format!("malformed multipart body: {e}")))
    })? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError(StowageError::Validation(format!("unreadable file field: {e}")))
                })?;
                payload = Some((bytes.to_vec(), filename, content_type));
            }
            Some("owner") => {
                let value = field.text().await.map_err(|e| {
                    ApiError(StowageError::Validation(format!("unreadable owner field: {e}")))
                })?;
                owner = Some(value);
            }
            _ => {}
        }
    }

    let (payload, original_filename, content_type) = payload.ok_or_else(|| {
        ApiError(StowageError::Validation(
            "multipart field 'file' is required".into(),
        ))
    })?;

    let accepted = state
        .inner
        .service
        .initiate_upload(UploadRequest {
            payload,
            original_filename,
            content_type,
            owner,
            idempotency_key,
            btl_days,
            user_id: context.user_id,
            bypass_key: context.api_key,
        })
        .await?;

    Ok(Json(serde_json::json!({
        "file_id": accepted.file_id,
        "message": "Upload successful",
    }))
    .into_response())
}

/// GET /files/{id} — reassembled bytes with descriptive headers.
pub async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let file_id = FileId::parse(&id)?;
    let file = state.inner.service.get_file(file_id).await?;

    Ok((
        StatusCode::OK,
        [
            ("Content-Type", file.metadata.content_type.clone()),
            ("Content-Length", file.bytes.len().to_string()),
            ("X-File-Extension", file.metadata.file_extension.clone()),
            ("X-Upload-Date", file.metadata.created_at.to_rfc3339()),
        ],
        file.bytes,
    )
        .into_response())
}

/// GET /files/{id}/info — metadata plus entity-key detail.
pub async fn info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let file_id = FileId::parse(&id)?;
    let info = state.inner.service.file_info(file_id).await?;
    Ok(Json(info).into_response())
}

/// GET /files/{id}/entities — ledger keys only.
pub async fn entities(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let file_id = FileId::parse(&id)?;
    let entities = state.inner.service.file_entities(file_id).await?;
    Ok(Json(entities).into_response())
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::super::test_helpers::*;

    #[tokio::test]
    async fn upload_then_download_round_trip() {
        let (router, service) = setup_app().await;

        let resp = multipart_upload(
            router.clone(),
            "round-trip-key",
            "hello.txt",
            "text/plain",
            b"hello world",
            &[],
        )
        .await;
        assert_status(&resp, StatusCode::OK);
        let body = json_body(resp).await;
        let file_id = body["file_id"].as_str().unwrap().to_string();
        assert_eq!(body["message"], "Upload successful");

        wait_completed(&service, "round-trip-key").await;

        let resp = authed_get(router, &format!("/files/{file_id}")).await;
        assert_status(&resp, StatusCode::OK);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "text/plain"
        );
        assert_eq!(resp.headers().get("X-File-Extension").unwrap(), "txt");
        assert!(resp.headers().get("X-Upload-Date").is_some());
        assert_eq!(body_bytes(resp).await, b"hello world");
    }

    #[tokio::test]
    async fn upload_without_idempotency_key_is_rejected() {
        let (router, _service) = setup_app().await;
        let resp = multipart_upload_no_key(router, "f.txt", "text/plain", b"body").await;
        assert_status(&resp, StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["code"], "VALIDATION");
    }

    #[tokio::test]
    async fn upload_with_bad_btl_header_is_rejected() {
        let (router, _service) = setup_app().await;
        let resp = multipart_upload(
            router,
            "bad-btl-key-1",
            "f.txt",
            "text/plain",
            b"body",
            &[("BTL-Days", "soon")],
        )
        .await;
        assert_status(&resp, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_of_unsupported_type_is_rejected() {
        let (router, _service) = setup_app().await;
        let resp = multipart_upload(
            router,
            "bad-type-key-1",
            "tool.exe",
            "application/x-msdownload",
            b"MZ",
            &[],
        )
        .await;
        assert_status(&resp, StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["code"], "UNSUPPORTED_TYPE");
    }

    #[tokio::test]
    async fn idempotent_upload_returns_same_file_id() {
        let (router, service) = setup_app().await;

        let first = multipart_upload(
            router.clone(),
            "idem-key-1",
            "a.txt",
            "text/plain",
            b"one",
            &[],
        )
        .await;
        let first_id = json_body(first).await["file_id"].as_str().unwrap().to_string();
        wait_completed(&service, "idem-key-1").await;

        let second = multipart_upload(
            router,
            "idem-key-1",
            "b.txt",
            "text/plain",
            b"different body",
            &[],
        )
        .await;
        let second_id = json_body(second).await["file_id"].as_str().unwrap().to_string();
        assert_eq!(first_id, second_id);
    }

    #[tokio::test]
    async fn download_of_unknown_file_is_404() {
        let (router, _service) = setup_app().await;
        let resp = authed_get(
            router,
            "/files/00000000-0000-4000-8000-000000000000",
        )
        .await;
        assert_status(&resp, StatusCode::NOT_FOUND);
        let body = json_body(resp).await;
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn info_and_entities_expose_ledger_keys() {
        let (router, service) = setup_app().await;

        let resp = multipart_upload(
            router.clone(),
            "info-key-1",
            "doc.pdf",
            "application/pdf",
            &[7u8; 100],
            &[("BTL-Days", "7")],
        )
        .await;
        let file_id = json_body(resp).await["file_id"].as_str().unwrap().to_string();
        wait_completed(&service, "info-key-1").await;

        let resp = authed_get(router.clone(), &format!("/files/{file_id}/info")).await;
        assert_status(&resp, StatusCode::OK);
        let info = json_body(resp).await;
        assert_eq!(info["file_extension"], "pdf");
        assert_eq!(info["btl_days"], 7);
        assert!(info["metadata_entity_key"].is_string());
        assert!(info["expires_at"].is_string());

        let resp = authed_get(router, &format!("/files/{file_id}/entities")).await;
        let entities = json_body(resp).await;
        let chunk_keys = entities["chunk_entity_keys"].as_array().unwrap();
        assert!(!chunk_keys.is_empty());
        assert_eq!(
            entities["total_entities"].as_u64().unwrap(),
            chunk_keys.len() as u64 + 1
        );
    }
}
