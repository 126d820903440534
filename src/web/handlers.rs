// HTTP handlers. The interesting work happens in the pipeline; these only
// translate between axum extractors and a Job.

use super::{
    SharedPipeline,
    extract_upload::{into_upload, is_image_field, reject_multipart},
    request_body_limit,
};
use crate::pipeline::{JobError, NoUpload, ValidationError};
use axum::{
    extract::{Multipart, State, multipart::MultipartRejection},
    response::{Html, IntoResponse, Redirect, Response},
};
use axum_extra::TypedHeader;
use headers::ContentLength;
use tracing::{debug, info};

const UPLOAD_PAGE: &str = include_str!("../../static/test.html");

// --- POST /api/process-image ---
// Accepts a multipart form with an `image` field and responds with the
// background-removed PNG.
pub async fn process_image(
    State(pipeline): State<SharedPipeline>,
    content_length: Option<TypedHeader<ContentLength>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, JobError> {
    let job = pipeline.new_job();
    let limits = pipeline.limits();
    info!(
        parent: job.span(),
        "Received new image processing request"
    );

    // Refuse obviously oversized bodies before reading any of them.
    if let Some(TypedHeader(ContentLength(length))) = content_length {
        if length > request_body_limit(limits) {
            return pipeline
                .reject(
                    job,
                    ValidationError::TooLarge {
                        limit_bytes: limits.max_upload_bytes,
                    },
                )
                .await;
        }
    }

    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            return pipeline
                .reject(job, ValidationError::MalformedUpload(rejection.body_text()))
                .await;
        }
    };

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if is_image_field(&field) => {
                return pipeline.process(job, Some(into_upload(field))).await;
            }
            Ok(Some(field)) => {
                debug!(
                    parent: job.span(),
                    "Ignoring multipart field: {}",
                    field.name().unwrap_or("unnamed")
                );
            }
            Ok(None) => return pipeline.process(job, None::<NoUpload>).await,
            Err(e) => {
                return pipeline
                    .reject(job, reject_multipart(e, limits.max_upload_bytes))
                    .await;
            }
        }
    }
}

// --- GET / ---
pub async fn index() -> Redirect {
    Redirect::to("/test.html")
}

// --- GET /test.html ---
pub async fn upload_page() -> impl IntoResponse {
    Html(UPLOAD_PAGE)
}
