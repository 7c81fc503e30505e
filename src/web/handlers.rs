//! Catalog handlers: list, upload, download, delete.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::Multipart;

use crate::dlog;
use crate::protocol::sanitize_filename;
use crate::web::AppState;

/// Build a standard JSON error response.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "status": "error", "message": message.into() });
    (status, Json(body)).into_response()
}

/// `GET /api/files` — the reconciled catalog listing, newest first.
pub async fn list_files_handler(State(state): State<AppState>) -> Response {
    match state.catalog.list() {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            dlog!("web: list failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// `POST /upload` — multipart form upload, field name `file`.
pub async fn upload_handler(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut saved: Option<(String, u64)> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let raw_name = match field.file_name() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return api_error(StatusCode::BAD_REQUEST, "No selected file"),
        };
        let filename = match sanitize_filename(&raw_name) {
            Some(filename) => filename,
            None => return api_error(StatusCode::BAD_REQUEST, "Invalid filename"),
        };
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return api_error(StatusCode::BAD_REQUEST, format!("failed to read file: {e}"))
            }
        };

        let path = state.catalog.file_path(&filename);
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            dlog!("web: failed to store {}: {e}", path.display());
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
        if let Err(e) = state.catalog.upsert_on_upload(&filename, bytes.len() as u64) {
            dlog!("web: failed to record upload of {filename}: {e}");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }

        dlog!("web: uploaded {filename} ({} bytes)", bytes.len());
        saved = Some((filename, bytes.len() as u64));
    }

    match saved {
        Some((filename, size)) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "status": "success",
                "filename": filename,
                "size": size,
            })),
        )
            .into_response(),
        None => api_error(StatusCode::BAD_REQUEST, "No file part"),
    }
}

/// `GET /download/{filename}` — the stored bytes as an attachment.
pub async fn download_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    let filename = match sanitize_filename(&filename) {
        Some(filename) => filename,
        None => return api_error(StatusCode::NOT_FOUND, "File not found"),
    };

    let bytes = match tokio::fs::read(state.catalog.file_path(&filename)).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return api_error(StatusCode::NOT_FOUND, "File not found");
        }
        Err(e) => {
            dlog!("web: failed to read {filename}: {e}");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    if let Err(e) = state.catalog.record_download(&filename) {
        dlog!("web: failed to record download of {filename}: {e}");
    }
    dlog!("web: downloaded {filename} ({} bytes)", bytes.len());

    (
        [
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response()
}

/// `DELETE /api/delete/{filename}` — remove the file and its record.
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    let deleted = sanitize_filename(&filename)
        .map(|filename| state.catalog.delete(&filename))
        .unwrap_or(false);

    if deleted {
        dlog!("web: deleted {filename}");
        Json(serde_json::json!({
            "status": "success",
            "message": format!("File {filename} deleted successfully"),
        }))
        .into_response()
    } else {
        api_error(
            StatusCode::NOT_FOUND,
            "File not found or could not be deleted",
        )
    }
}
