use super::{SharedPipeline, handlers, request_body_limit};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

pub fn create_app(pipeline: SharedPipeline) -> Router {
    let body_limit = usize::try_from(request_body_limit(pipeline.limits())).unwrap_or(usize::MAX);

    Router::new()
        .route("/", get(handlers::index))
        .route("/test.html", get(handlers::upload_page))
        .route(
            "/api/process-image",
            // Uploads beyond the limit fail while streaming, before the
            // whole body is buffered.
            post(handlers::process_image).layer(DefaultBodyLimit::max(body_limit)),
        )
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(pipeline)
}
