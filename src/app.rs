use std::any::Any;

use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::common::response::ApiError;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    with_layers(crate::routes::configure_routes(&state)).with_state(state)
}

/// Request tracing plus panic recovery. A panicking handler unwinds through
/// its job guards, so the job's files are still released.
pub fn with_layers(router: Router<AppState>) -> Router<AppState> {
    router
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %detail, "Request handler panicked");
    ApiError::internal().into_response()
}
