use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::caption::handler::upload_video,
        crate::routes::health,
    ),
    components(
        schemas(
            crate::common::response::ErrorBody,
            crate::modules::caption::dto::UploadForm,
        )
    ),
    tags(
        (name = "Captions", description = "Video captioning"),
        (name = "Health", description = "Service health")
    )
)]
pub struct ApiDoc;
