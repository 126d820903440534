// Upload validation: MIME and size checks, then a header-only dimension probe.
// Nothing here launches a worker; a rejected upload never gets that far.

use super::artifact_store::ArtifactStore;
use super::error::{JobError, ValidationError};
use super::job::{Dimensions, InputArtifact, Job, JobState};
use axum::body::Bytes;
use futures::{Stream, StreamExt};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_upload_bytes: u64,
    pub max_dimension: u32,
}

/// Failure reported by the transport while the file body is being read.
#[derive(Debug)]
pub enum UploadStreamError {
    TooLarge,
    Malformed(String),
}

/// A file as handed over by the transport layer, body not yet consumed.
pub struct IncomingUpload<S> {
    pub content_type: Option<String>,
    pub declared_size: Option<u64>,
    pub body: S,
}

#[derive(Debug, Clone)]
pub struct UploadValidator {
    store: ArtifactStore,
    limits: UploadLimits,
}

impl UploadValidator {
    pub fn new(store: ArtifactStore, limits: UploadLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> UploadLimits {
        self.limits
    }

    /// Accepts the upload onto the artifact store or rejects it. On success
    /// the job holds a probed `InputArtifact`; on rejection nothing of the
    /// upload remains on disk.
    pub async fn validate<S>(
        &self,
        job: &mut Job,
        upload: Option<IncomingUpload<S>>,
    ) -> Result<(), JobError>
    where
        S: Stream<Item = Result<Bytes, UploadStreamError>> + Unpin,
    {
        job.transition(JobState::Validating)
            .map_err(|e| JobError::Storage(std::io::Error::other(e)))?;

        let Some(upload) = upload else {
            warn!("No file uploaded");
            return Err(ValidationError::MissingFile.into());
        };

        let mime = self.check_declared(&upload)?;

        let result = self.receive(job, mime, upload).await;
        let result = match result {
            Ok(()) => self.probe(job).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            if let JobError::Validation(reason) = e {
                info!(reason = reason.reason(), "Upload rejected: {}", reason);
            }
            self.discard_input(job).await;
        }
        result
    }

    fn check_declared<S>(&self, upload: &IncomingUpload<S>) -> Result<String, ValidationError> {
        let raw = upload.content_type.clone().unwrap_or_default();
        let is_image = raw
            .parse::<mime::Mime>()
            .map(|m| m.type_() == mime::IMAGE)
            .unwrap_or(false);
        if !is_image {
            return Err(ValidationError::WrongType { mime: raw });
        }

        if let Some(size) = upload.declared_size {
            if size > self.limits.max_upload_bytes {
                return Err(ValidationError::TooLarge {
                    limit_bytes: self.limits.max_upload_bytes,
                });
            }
        }

        Ok(raw)
    }

    async fn receive<S>(
        &self,
        job: &mut Job,
        mime: String,
        mut upload: IncomingUpload<S>,
    ) -> Result<(), JobError>
    where
        S: Stream<Item = Result<Bytes, UploadStreamError>> + Unpin,
    {
        let (path, mut file) = self.store.create_input(job.id()).await?;
        job.set_input(InputArtifact {
            path,
            declared_size: upload.declared_size.unwrap_or(0),
            mime,
            dimensions: None,
        });

        let mut written: u64 = 0;
        while let Some(chunk) = upload.body.next().await {
            let chunk = chunk.map_err(|e| match e {
                UploadStreamError::TooLarge => ValidationError::TooLarge {
                    limit_bytes: self.limits.max_upload_bytes,
                },
                UploadStreamError::Malformed(msg) => ValidationError::MalformedUpload(msg),
            })?;

            written += chunk.len() as u64;
            if written > self.limits.max_upload_bytes {
                return Err(ValidationError::TooLarge {
                    limit_bytes: self.limits.max_upload_bytes,
                }
                .into());
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if written == 0 {
            return Err(ValidationError::MissingFile.into());
        }

        if let Some(input) = job.input_mut() {
            input.declared_size = written;
            debug!(
                "File received: {} ({} bytes, {})",
                input.path.display(),
                written,
                input.mime
            );
        }
        Ok(())
    }

    async fn probe(&self, job: &mut Job) -> Result<(), JobError> {
        let Some(path) = job.input().map(|i| i.path.clone()) else {
            return Err(ValidationError::MissingFile.into());
        };

        let dimensions = tokio::task::spawn_blocking(move || probe_dimensions(path))
            .await
            .map_err(|e| JobError::Storage(std::io::Error::other(e)))??;

        let max = self.limits.max_dimension;
        if dimensions.width > max || dimensions.height > max {
            return Err(ValidationError::DimensionsTooLarge {
                actual: dimensions,
                max,
            }
            .into());
        }

        if let Some(input) = job.input_mut() {
            input.dimensions = Some(dimensions);
        }
        debug!("Image dimensions {} within limit {}", dimensions, max);
        Ok(())
    }

    async fn discard_input(&self, job: &mut Job) {
        if let Some(path) = job.input().map(|i| i.path.clone()) {
            match self.store.delete(&path).await {
                Ok(_) => {
                    // Only forget the path once it is really gone, so the
                    // job's cleanup can still retry.
                    job.take_artifact_paths();
                }
                Err(e) => warn!("Error deleting rejected upload {}: {}", path.display(), e),
            }
        }
    }
}

/// Reads just enough of the file to learn its pixel size.
fn probe_dimensions(path: PathBuf) -> Result<Dimensions, JobError> {
    let reader = image::ImageReader::open(&path)?
        .with_guessed_format()
        .map_err(JobError::Storage)?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| ValidationError::UnreadableImage(e.to_string()))?;
    Ok(Dimensions { width, height })
}
