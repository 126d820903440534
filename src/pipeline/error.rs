// Error types raised by the job pipeline stages.
// The web layer maps these onto HTTP responses (see web/error.rs).

use super::job::{Dimensions, JobState};
use std::time::Duration;
use thiserror::Error;

/// Reasons an upload is refused before any worker is launched.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("No image file uploaded")]
    MissingFile,

    #[error("Only image files are allowed (received '{mime}')")]
    WrongType { mime: String },

    #[error("File size too large. Maximum size is {limit_bytes} bytes")]
    TooLarge { limit_bytes: u64 },

    #[error(
        "Image dimensions too large ({actual}). Maximum allowed is {max}x{max} pixels"
    )]
    DimensionsTooLarge { actual: Dimensions, max: u32 },

    #[error("Uploaded file is not a readable image: {0}")]
    UnreadableImage(String),

    #[error("Malformed upload: {0}")]
    MalformedUpload(String),
}

impl ValidationError {
    /// Stable kebab-case reason, used in logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingFile => "missing-file",
            Self::WrongType { .. } => "wrong-type",
            Self::TooLarge { .. } => "too-large",
            Self::DimensionsTooLarge { .. } => "dimensions-too-large",
            Self::UnreadableImage(_) => "unreadable-image",
            Self::MalformedUpload(_) => "malformed-upload",
        }
    }
}

/// Terminal failure of a job. Exactly one of these (or success) ends every job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to start worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Processing failed: {summary}")]
    WorkerFailed {
        exit: String,
        summary: String,
        diagnostics: String,
    },

    #[error("Output file not found or empty")]
    OutputMissing { diagnostics: String },

    #[error(
        "Processing timed out after {}s. Please try with a smaller image or reduce image complexity.",
        .timeout.as_secs()
    )]
    TimedOut { timeout: Duration },

    #[error("Server is busy processing other images. Please retry shortly.")]
    Busy,

    #[error("Scratch storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl JobError {
    /// The state a job lands in when it ends with this error.
    pub fn terminal_state(&self) -> JobState {
        match self {
            Self::Validation(_) => JobState::Rejected,
            Self::TimedOut { .. } => JobState::TimedOut,
            Self::Spawn(_)
            | Self::WorkerFailed { .. }
            | Self::OutputMissing { .. }
            | Self::Busy
            | Self::Storage(_) => JobState::Failed,
        }
    }

    /// Worker diagnostics attached to this failure, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::WorkerFailed { diagnostics, .. } | Self::OutputMissing { diagnostics } => {
                Some(diagnostics.as_str()).filter(|d| !d.is_empty())
            }
            _ => None,
        }
    }
}

/// Raised when a job is asked to make a transition its lifecycle forbids.
#[derive(Debug, Error)]
#[error("illegal job transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}
