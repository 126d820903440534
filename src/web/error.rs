// Error responses for the API. Every failure becomes a single JSON object
// `{"error": "...", "details": "..."}`; `details` only appears for worker
// failures.

use super::models::ErrorBody;
use crate::pipeline::{JobError, ValidationError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    PayloadTooLarge(String),
    InternalServerError {
        message: String,
        details: Option<String>,
    },
    ServiceUnavailable(String),
    GatewayTimeout(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InternalServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::BadRequest(error)
            | Self::PayloadTooLarge(error)
            | Self::ServiceUnavailable(error)
            | Self::GatewayTimeout(error) => ErrorBody {
                error,
                details: None,
            },
            Self::InternalServerError { message, details } => ErrorBody {
                error: message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        let message = error.to_string();
        match error {
            ValidationError::TooLarge { .. } | ValidationError::DimensionsTooLarge { .. } => {
                Self::PayloadTooLarge(message)
            }
            ValidationError::MissingFile
            | ValidationError::WrongType { .. }
            | ValidationError::UnreadableImage(_)
            | ValidationError::MalformedUpload(_) => Self::BadRequest(message),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(error: JobError) -> Self {
        let message = error.to_string();
        match error {
            JobError::Validation(e) => e.into(),
            JobError::TimedOut { .. } => Self::GatewayTimeout(message),
            JobError::Busy => Self::ServiceUnavailable(message),
            JobError::WorkerFailed { diagnostics, .. } => Self::InternalServerError {
                message,
                details: Some(diagnostics),
            },
            JobError::OutputMissing { diagnostics } => Self::InternalServerError {
                message,
                details: Some(diagnostics).filter(|d| !d.is_empty()),
            },
            JobError::Spawn(_) => Self::InternalServerError {
                message,
                details: None,
            },
            JobError::Storage(e) => Self::InternalServerError {
                message: format!("Error processing image: {}", e),
                details: None,
            },
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Dimensions;
    use http_body_util::BodyExt;
    use std::time::Duration;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_validation_statuses() {
        let cases = [
            (ValidationError::MissingFile, StatusCode::BAD_REQUEST),
            (
                ValidationError::WrongType {
                    mime: "text/plain".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                ValidationError::TooLarge { limit_bytes: 10 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                ValidationError::DimensionsTooLarge {
                    actual: Dimensions {
                        width: 6000,
                        height: 4000,
                    },
                    max: 2000,
                },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[tokio::test]
    async fn test_timeout_is_gateway_timeout_without_details() {
        let response = ApiError::from(JobError::TimedOut {
            timeout: Duration::from_secs(120),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("timed out"));
        assert!(json.get("details").is_none());
    }

    #[tokio::test]
    async fn test_worker_failure_carries_details() {
        let response = ApiError::from(JobError::WorkerFailed {
            exit: "exit code 1".into(),
            summary: "Failed to remove background".into(),
            diagnostics: "Traceback ...".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(
            json["error"],
            "Processing failed: Failed to remove background"
        );
        assert_eq!(json["details"], "Traceback ...");
    }

    #[tokio::test]
    async fn test_job_error_renders_as_api_error() {
        let response = JobError::Busy.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("busy"));
    }
}
