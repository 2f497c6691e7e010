use utoipa::ToSchema;

/// Multipart field carrying the video.
pub const VIDEO_FIELD: &str = "video";

/// Filename offered to the caller for the processed video.
pub const DOWNLOAD_FILENAME: &str = "captioned_video.mp4";

/// Shape of the upload form, for the API docs only.
#[derive(ToSchema)]
pub struct UploadForm {
    #[schema(value_type = String, format = Binary)]
    pub video: Vec<u8>,
}
