use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    response::{IntoResponse, Response},
};
use tracing::info;

use super::dto::{UploadForm, VIDEO_FIELD};
use super::service::JobResult;
use super::stream_handler::download;
use crate::common::response::{ApiError, ErrorBody};
use crate::common::upload::stage_field;
use crate::state::AppState;

/// Upload a video and receive it back with burned-in captions.
///
/// The upload is staged to disk, handed to the captioning worker, and the
/// result is streamed back. All files for the job are removed once the
/// download finishes or fails.
#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Captioned video", content_type = "video/mp4", body = Vec<u8>),
        (status = 400, description = "Missing or invalid upload", body = ErrorBody),
        (status = 413, description = "Upload too large", body = ErrorBody),
        (status = 500, description = "Processing failed", body = ErrorBody)
    ),
    tag = "Captions"
)]
pub async fn upload_video(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    info!("Received video upload request");

    let mut multipart = match multipart {
        Ok(m) => m,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };

    let blob = loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                info!("No file uploaded");
                return ApiError::bad_request("No video file uploaded").into_response();
            }
            Err(e) => return ApiError::from(e).into_response(),
        };

        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }

        match stage_field(
            state.coordinator.store(),
            field,
            state.config.max_upload_bytes,
        )
        .await
        {
            Ok(blob) => break blob,
            Err(e) => return e.into_response(),
        }
    };

    match state.coordinator.execute_staged(blob).await {
        JobResult::Ready(ready) => download(ready).await,
        // the failure's cleanup guard drops once the error body is built
        JobResult::Failed(failure) => ApiError::from(failure.reason()).into_response(),
    }
}
