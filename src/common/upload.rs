use axum::extract::multipart::Field;
use axum::http::StatusCode;
use futures_util::TryStreamExt;
use tracing::info;

use crate::common::response::ApiError;
use crate::infrastructure::storage::local::{extension_of, BlobStore, StageError};
use crate::modules::caption::model::BlobRef;

/// Checks the declared (or guessed) content type of an uploaded file.
///
/// Browsers do not always label video parts, so an untyped or generic
/// octet-stream part is accepted when its filename looks like a video.
pub fn accepts_content_type(declared: Option<&str>, file_name: &str) -> bool {
    let guessed = mime_guess::from_path(file_name).first();
    let mime = match declared.and_then(|ct| ct.parse::<mime::Mime>().ok()) {
        Some(m) if m == mime::APPLICATION_OCTET_STREAM => guessed.unwrap_or(m),
        Some(m) => m,
        None => match guessed {
            Some(m) => m,
            None => return true,
        },
    };

    mime.type_() == mime::VIDEO || mime == mime::APPLICATION_OCTET_STREAM
}

/// Streams one multipart field to disk as the input of a new job.
pub async fn stage_field(
    store: &BlobStore,
    field: Field<'_>,
    max_bytes: u64,
) -> Result<BlobRef, ApiError> {
    let file_name = field.file_name().unwrap_or("video.mp4").to_string();

    if !accepts_content_type(field.content_type(), &file_name) {
        return Err(ApiError::bad_request(
            "Invalid content type: only video uploads are accepted",
        ));
    }

    // the request body limit can trip while this field is still streaming
    let chunks = field.map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            StageError::TooLarge { limit: max_bytes }
        } else {
            StageError::Stream(e.body_text())
        }
    });
    let blob = store
        .stage_stream(chunks, &extension_of(&file_name), max_bytes)
        .await?;

    info!(job_id = %blob.job_id, "Received upload {}", file_name);
    Ok(blob)
}
