use crate::AppState;
use crate::api::error::AppError;
use crate::models::{ExtractionResult, Notice, RemoteFile};
use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartError},
    http::StatusCode,
};
use bytes::Bytes;
use serde::Serialize;
use utoipa::ToSchema;

/// Multipart form accepted by `/extract`
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct ExtractForm {
    /// png, jpg or jpeg image of the bank document
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}

#[derive(Serialize, ToSchema)]
pub struct ExtractResponse {
    pub file_name: String,
    pub remote_file: RemoteFile,
    /// `{"kind": "json", "value": {...}}` or `{"kind": "raw", "value": "..."}`
    #[schema(value_type = Object)]
    pub result: ExtractionResult,
    pub notices: Vec<Notice>,
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::BadRequest(e.body_text())
    }
}

#[utoipa::path(
    post,
    path = "/extract",
    request_body(content = ExtractForm, content_type = "multipart/form-data", description = "Image upload"),
    responses(
        (status = 200, description = "Extraction finished (parsed JSON or raw model text)", body = ExtractResponse),
        (status = 400, description = "Missing or invalid image"),
        (status = 413, description = "Image too large"),
        (status = 502, description = "Gemini upload or generation failed")
    ),
    tag = "extract"
)]
pub async fn extract(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ExtractResponse>, AppError> {
    let mut upload: Option<(String, Option<String>, Bytes)> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("unnamed").to_string();
        let content_type = field.content_type().map(|s| s.to_string());
        let data = field.bytes().await.map_err(multipart_error)?;
        upload = Some((filename, content_type, data));
    }

    let (filename, content_type, data) =
        upload.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;

    let outcome = state
        .extractor
        .extract(&filename, content_type.as_deref(), &data)
        .await?;

    Ok(Json(ExtractResponse {
        file_name: filename,
        remote_file: outcome.remote_file,
        result: outcome.result,
        notices: outcome.notices,
    }))
}
