// Turns a finished job into its single outcome: a streamed PNG response, or
// the error the web layer renders. Removes the job's artifacts once that
// outcome no longer needs them.

use super::artifact_store::ArtifactStore;
use super::error::JobError;
use super::job::{Job, JobState};
use axum::{
    body::{Body, Bytes},
    http::header,
    response::{IntoResponse, Response},
};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::io::ReaderStream;
use tracing::{Instrument, debug, error, info, warn};

pub const OUTPUT_CONTENT_TYPE: &str = "image/png";

#[derive(Debug, Clone)]
pub struct DeliveryCoordinator {
    store: ArtifactStore,
}

impl DeliveryCoordinator {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Produces the outcome for `job`. Returns `None` if the job has
    /// already responded; the artifacts are cleaned up either way. By the
    /// time an error is returned, the job's files are already gone.
    pub async fn deliver(
        &self,
        mut job: Job,
        result: Result<u64, JobError>,
    ) -> Option<Result<Response, JobError>> {
        if !job.claim_response() {
            warn!("Response already sent for this job, ignoring duplicate delivery");
            self.cleanup(&mut job).await;
            return None;
        }

        match result {
            Ok(_) => match self.stream_output(job).await {
                Ok(response) => Some(Ok(response)),
                Err((mut job, e)) => {
                    error!("Error opening processed image for sending: {}", e);
                    self.record_terminal(&mut job, JobState::Failed);
                    self.cleanup(&mut job).await;
                    Some(Err(JobError::Storage(e)))
                }
            },
            Err(err) => Some(Err(self.fail(job, err).await)),
        }
    }

    /// Records the failure and deletes everything the job created.
    async fn fail(&self, mut job: Job, err: JobError) -> JobError {
        match &err {
            JobError::Validation(reason) => {
                info!(reason = reason.reason(), "Request rejected: {}", reason)
            }
            JobError::Busy => warn!("{}", err),
            _ => {
                error!("Processing failed: {}", err);
                if let Some(diagnostics) = err.diagnostics() {
                    debug!("Worker diagnostics:\n{}", diagnostics);
                }
            }
        }
        self.record_terminal(&mut job, err.terminal_state());
        self.cleanup(&mut job).await;
        err
    }

    async fn stream_output(&self, job: Job) -> Result<Response, (Job, std::io::Error)> {
        let Some(output) = job.output().filter(|o| o.is_ready()).cloned() else {
            let e = std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "job succeeded without a ready output artifact",
            );
            return Err((job, e));
        };

        let file = match tokio::fs::File::open(&output.path).await {
            Ok(file) => file,
            Err(e) => return Err((job, e)),
        };

        info!(
            "Sending processed file: {} ({} bytes)",
            output.path.display(),
            output.size.unwrap_or(0)
        );

        let body = ArtifactBody {
            stream: ReaderStream::new(file),
            job: Some(job),
            store: self.store.clone(),
        };

        let mut response = Body::from_stream(body).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static(OUTPUT_CONTENT_TYPE),
        );
        if let Some(size) = output.size {
            headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(size));
        }
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        );
        Ok(response)
    }

    fn record_terminal(&self, job: &mut Job, state: JobState) {
        if !job.state().is_terminal() {
            let _ = job.transition(state);
        }
    }

    /// Deletes every artifact the job still owns. Safe to call repeatedly.
    pub async fn cleanup(&self, job: &mut Job) {
        debug!("Removing artifacts {:?}", job.artifact_paths());
        let paths = job.take_artifact_paths();
        let removed = self.store.delete_all(&paths).await;
        if job.state().is_terminal() {
            let _ = job.transition(JobState::CleanedUp);
        }
        info!("Cleaned up {} temporary file(s)", removed);
    }
}

/// Response body streaming the output file. Owns the job until the stream
/// ends, then hands it to a cleanup task. If the body is dropped early
/// (client went away) the job's own drop removes the files.
struct ArtifactBody {
    stream: ReaderStream<tokio::fs::File>,
    job: Option<Job>,
    store: ArtifactStore,
}

impl ArtifactBody {
    fn finish(&mut self) {
        let Some(mut job) = self.job.take() else {
            return;
        };
        let coordinator = DeliveryCoordinator::new(self.store.clone());
        let span = job.span().clone();
        tokio::spawn(
            async move {
                coordinator.cleanup(&mut job).await;
            }
            .instrument(span),
        );
    }
}

impl Stream for ArtifactBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.stream).poll_next(cx) {
            Poll::Ready(Some(Err(e))) => {
                // Headers are already out; all we can do is log and stop.
                if let Some(job) = &this.job {
                    error!(parent: job.span(), "Error sending file: {}", e);
                }
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::scratch_base;
    use crate::pipeline::error::ValidationError;
    use crate::pipeline::job::InputArtifact;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;

    async fn job_with_files(store: &ArtifactStore, output: Option<&[u8]>) -> Job {
        let mut job = Job::new(1024);
        job.transition(JobState::Validating).unwrap();
        let (path, file) = store.create_input(job.id()).await.unwrap();
        drop(file);
        let out_path = store.output_path_for(&path);
        job.set_input(InputArtifact {
            path,
            declared_size: 0,
            mime: "image/png".into(),
            dimensions: None,
        });
        job.set_output_target(out_path.clone());
        job.transition(JobState::Executing).unwrap();
        if let Some(bytes) = output {
            tokio::fs::write(&out_path, bytes).await.unwrap();
            job.mark_output_ready(bytes.len() as u64);
        }
        job
    }

    #[tokio::test]
    async fn test_success_streams_file_then_cleans_up() {
        let base = scratch_base();
        let store = ArtifactStore::open(&base).await.unwrap();
        let mut job = job_with_files(&store, Some(b"png-bytes")).await;
        job.transition(JobState::Succeeded).unwrap();

        let response = DeliveryCoordinator::new(store.clone())
            .deliver(job, Ok(9))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            OUTPUT_CONTENT_TYPE
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"png-bytes");

        // Cleanup runs on a spawned task once the stream ends.
        for _ in 0..50 {
            if store.list().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(store.list().await.unwrap().is_empty());
        tokio::fs::remove_dir_all(&base).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_body_still_cleans_up() {
        let base = scratch_base();
        let store = ArtifactStore::open(&base).await.unwrap();
        let mut job = job_with_files(&store, Some(b"png-bytes")).await;
        job.transition(JobState::Succeeded).unwrap();

        let response = DeliveryCoordinator::new(store.clone())
            .deliver(job, Ok(9))
            .await
            .unwrap()
            .unwrap();
        drop(response);

        assert!(store.list().await.unwrap().is_empty());
        tokio::fs::remove_dir_all(&base).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_removes_partial_output() {
        let base = scratch_base();
        let store = ArtifactStore::open(&base).await.unwrap();
        let mut job = job_with_files(&store, None).await;
        let partial = job.output().unwrap().path.clone();
        tokio::fs::write(&partial, b"half").await.unwrap();
        job.transition(JobState::Failed).unwrap();

        let outcome = DeliveryCoordinator::new(store.clone())
            .deliver(
                job,
                Err(JobError::OutputMissing {
                    diagnostics: String::new(),
                }),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, Err(JobError::OutputMissing { .. })));
        assert!(store.list().await.unwrap().is_empty());
        tokio::fs::remove_dir_all(&base).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_refused() {
        let base = scratch_base();
        let store = ArtifactStore::open(&base).await.unwrap();
        let mut job = job_with_files(&store, None).await;
        job.transition(JobState::TimedOut).unwrap();
        assert!(job.claim_response());

        let second = DeliveryCoordinator::new(store.clone())
            .deliver(
                job,
                Err(JobError::TimedOut {
                    timeout: std::time::Duration::from_secs(1),
                }),
            )
            .await;
        assert!(second.is_none());
        assert!(store.list().await.unwrap().is_empty());
        tokio::fs::remove_dir_all(&base).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_is_returned_to_caller() {
        let base = scratch_base();
        let store = ArtifactStore::open(&base).await.unwrap();
        let job = Job::new(1024);

        let outcome = DeliveryCoordinator::new(store)
            .deliver(job, Err(ValidationError::MissingFile.into()))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Err(JobError::Validation(ValidationError::MissingFile))
        ));
        tokio::fs::remove_dir_all(&base).await.unwrap();
    }
}
