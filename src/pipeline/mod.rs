// Per-request job pipeline: validate -> admit -> execute -> deliver -> cleanup.

mod admission;
mod artifact_store;
mod delivery;
mod diagnostics;
mod error;
mod job;
mod supervisor;
mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::AdmissionGate;
pub use artifact_store::ArtifactStore;
pub use delivery::DeliveryCoordinator;
pub use error::{JobError, ValidationError};
pub use job::Job;
pub use supervisor::{TargetSize, WorkerCommand, WorkerSupervisor};
pub use validator::{IncomingUpload, UploadLimits, UploadStreamError, UploadValidator};

#[cfg(test)]
pub use delivery::OUTPUT_CONTENT_TYPE;
#[cfg(test)]
pub use job::Dimensions;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::Stream;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Instrument, error, info};

/// Upload placeholder for requests that carried no file at all.
pub type NoUpload = IncomingUpload<futures::stream::Empty<Result<Bytes, UploadStreamError>>>;

/// Everything the pipeline needs to know, resolved from the command line.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub scratch_dir: PathBuf,
    pub limits: UploadLimits,
    pub worker: WorkerCommand,
    pub target: TargetSize,
    pub worker_timeout: Duration,
    pub max_concurrent_workers: usize,
    pub admission_timeout: Duration,
    pub max_diagnostics_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ImagePipeline {
    store: ArtifactStore,
    validator: UploadValidator,
    gate: AdmissionGate,
    supervisor: WorkerSupervisor,
    delivery: DeliveryCoordinator,
    max_diagnostics_bytes: usize,
}

impl ImagePipeline {
    pub async fn new(settings: PipelineSettings) -> std::io::Result<Self> {
        let store = ArtifactStore::open(&settings.scratch_dir).await?;
        Ok(Self {
            validator: UploadValidator::new(store.clone(), settings.limits),
            gate: AdmissionGate::new(
                settings.max_concurrent_workers,
                settings.admission_timeout,
            ),
            supervisor: WorkerSupervisor::new(
                settings.worker,
                settings.target,
                settings.worker_timeout,
            ),
            delivery: DeliveryCoordinator::new(store.clone()),
            store,
            max_diagnostics_bytes: settings.max_diagnostics_bytes,
        })
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn limits(&self) -> UploadLimits {
        self.validator.limits()
    }

    pub fn new_job(&self) -> Job {
        Job::new(self.max_diagnostics_bytes)
    }

    /// Runs a job to completion. The result is its one response: the
    /// streamed PNG, or the error that ended it, already cleaned up.
    pub async fn process<S>(
        &self,
        job: Job,
        upload: Option<IncomingUpload<S>>,
    ) -> Result<Response, JobError>
    where
        S: Stream<Item = Result<Bytes, UploadStreamError>> + Unpin,
    {
        let span = job.span().clone();
        async move {
            let mut job = job;
            let result = self.execute(&mut job, upload).await;
            self.respond(job, result).await
        }
        .instrument(span)
        .await
    }

    /// Ends a job that failed before reaching the validator (e.g. a broken
    /// multipart body).
    pub async fn reject(&self, job: Job, reason: ValidationError) -> Result<Response, JobError> {
        let span = job.span().clone();
        self.respond(job, Err(reason.into())).instrument(span).await
    }

    async fn execute<S>(
        &self,
        job: &mut Job,
        upload: Option<IncomingUpload<S>>,
    ) -> Result<u64, JobError>
    where
        S: Stream<Item = Result<Bytes, UploadStreamError>> + Unpin,
    {
        self.validator.validate(job, upload).await?;

        let Some(_permit) = self.gate.admit().await else {
            return Err(JobError::Busy);
        };

        let input_path = job
            .input()
            .map(|i| i.path.clone())
            .ok_or(ValidationError::MissingFile)?;
        let output_path = self.store.output_path_for(&input_path);
        info!(
            "Input path: {}, output path: {}",
            input_path.display(),
            output_path.display()
        );
        job.set_output_target(output_path);

        let outcome = self.supervisor.run(job).await;
        outcome.into_result(job, self.supervisor.timeout())
    }

    async fn respond(&self, job: Job, result: Result<u64, JobError>) -> Result<Response, JobError> {
        self.delivery.deliver(job, result).await.unwrap_or_else(|| {
            error!("Job produced no response");
            Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        })
    }
}
