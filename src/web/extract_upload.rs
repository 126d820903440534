// Turns the `image` part of a multipart request into a streaming upload, so
// the file is never buffered whole in memory.

use crate::pipeline::{IncomingUpload, UploadStreamError, ValidationError};
use axum::{
    body::Bytes,
    extract::multipart::{Field, MultipartError},
    http::StatusCode,
};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use tracing::debug;

pub const IMAGE_FIELD_NAME: &str = "image";

pub type FieldStream<'a> =
    Pin<Box<dyn Stream<Item = Result<Bytes, UploadStreamError>> + Send + 'a>>;

pub fn is_image_field(field: &Field<'_>) -> bool {
    field.name() == Some(IMAGE_FIELD_NAME)
}

pub fn into_upload(field: Field<'_>) -> IncomingUpload<FieldStream<'_>> {
    debug!(
        "Received file {:?} with content type {:?}",
        field.file_name(),
        field.content_type()
    );
    let content_type = field.content_type().map(str::to_string);
    let body = field.map(|chunk| chunk.map_err(stream_error));
    IncomingUpload {
        content_type,
        // Parts rarely carry their own length; the validator counts bytes
        // as they arrive instead.
        declared_size: None,
        body: Box::pin(body),
    }
}

/// Maps a failure to read the multipart envelope itself.
pub fn reject_multipart(err: MultipartError, limit_bytes: u64) -> ValidationError {
    match stream_error(err) {
        UploadStreamError::TooLarge => ValidationError::TooLarge { limit_bytes },
        UploadStreamError::Malformed(msg) => ValidationError::MalformedUpload(msg),
    }
}

fn stream_error(err: MultipartError) -> UploadStreamError {
    // Body limit hits surface as 413 from axum's multipart layer.
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadStreamError::TooLarge
    } else {
        UploadStreamError::Malformed(err.body_text())
    }
}
