// Web server: routes, listeners and the HTTP mapping of pipeline results.

mod app;
mod error;
mod extract_upload;
mod handlers;
mod listeners;
mod models;

pub use app::create_app;
pub use error::ApiError;
pub use listeners::create_listener;

use crate::pipeline::{ImagePipeline, UploadLimits};
use std::sync::Arc;

// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

pub type SharedPipeline = Arc<ImagePipeline>;

/// Largest request body accepted for an upload.
pub fn request_body_limit(limits: UploadLimits) -> u64 {
    limits.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES)
}
