// The Job: per-request state threaded through validate -> execute -> deliver.
// Each stage takes `&mut Job` (or ownership, for delivery), so only one stage
// can touch a job at a time.

use super::diagnostics::Diagnostics;
use super::error::TransitionError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tracing::{Span, debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Received,
    Validating,
    Rejected,
    Executing,
    TimedOut,
    Failed,
    Succeeded,
    CleanedUp,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::TimedOut | Self::Failed | Self::Succeeded
        )
    }

    fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Received, Validating | Rejected) => true,
            (Validating, Rejected | Executing | Failed) => true,
            (Executing, TimedOut | Failed | Succeeded) => true,
            (from, CleanedUp) => from.is_terminal(),
            _ => false,
        }
    }
}

/// Pixel size of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The uploaded file as stored in the scratch directory.
#[derive(Debug, Clone)]
pub struct InputArtifact {
    pub path: PathBuf,
    pub declared_size: u64,
    pub mime: String,
    pub dimensions: Option<Dimensions>,
}

/// Target file for the worker. `size` is only set once the worker has
/// produced a non-empty file there.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub path: PathBuf,
    pub size: Option<u64>,
}

impl OutputArtifact {
    pub fn is_ready(&self) -> bool {
        self.size.is_some()
    }
}

pub struct Job {
    id: Uuid,
    state: JobState,
    input: Option<InputArtifact>,
    output: Option<OutputArtifact>,
    diagnostics: Diagnostics,
    deadline: Option<Instant>,
    responded: bool,
    span: Span,
}

impl Job {
    pub fn new(max_diagnostics_bytes: usize) -> Self {
        let id = Uuid::new_v4();
        let span = tracing::info_span!("job", job_id = %id);
        Self {
            id,
            state: JobState::Received,
            input: None,
            output: None,
            diagnostics: Diagnostics::new(max_diagnostics_bytes),
            deadline: None,
            responded: false,
            span,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Span every stage logs under while it owns the job.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            warn!(parent: &self.span, from = ?self.state, to = ?next, "Refusing illegal job transition");
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        debug!(parent: &self.span, from = ?self.state, to = ?next, "Job transition");
        self.state = next;
        Ok(())
    }

    pub fn input(&self) -> Option<&InputArtifact> {
        self.input.as_ref()
    }

    pub fn input_mut(&mut self) -> Option<&mut InputArtifact> {
        self.input.as_mut()
    }

    pub fn set_input(&mut self, input: InputArtifact) {
        self.input = Some(input);
    }

    pub fn output(&self) -> Option<&OutputArtifact> {
        self.output.as_ref()
    }

    pub fn set_output_target(&mut self, path: PathBuf) {
        self.output = Some(OutputArtifact { path, size: None });
    }

    pub fn mark_output_ready(&mut self, size: u64) {
        if let Some(output) = self.output.as_mut() {
            output.size = Some(size);
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Claims the right to send the job's response. Returns `false` if a
    /// response has already been claimed.
    pub fn claim_response(&mut self) -> bool {
        !std::mem::replace(&mut self.responded, true)
    }

    pub fn has_responded(&self) -> bool {
        self.responded
    }

    /// Paths of every artifact this job still owns. Taking them hands
    /// responsibility for deletion to the caller.
    pub fn take_artifact_paths(&mut self) -> Vec<PathBuf> {
        let input = self.input.take().map(|i| i.path);
        let output = self.output.take().map(|o| o.path);
        input.into_iter().chain(output).collect()
    }

    pub fn artifact_paths(&self) -> Vec<&Path> {
        let input = self.input.as_ref().map(|i| i.path.as_path());
        let output = self.output.as_ref().map(|o| o.path.as_path());
        input.into_iter().chain(output).collect()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("responded", &self.responded)
            .finish()
    }
}

// Last line of defence for the cleanup invariant, e.g. when the request
// future is dropped on client disconnect.
impl Drop for Job {
    fn drop(&mut self) {
        if !self.has_responded() {
            debug!(parent: &self.span, "Job dropped before a response was sent");
        }
        for path in self.take_artifact_paths() {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    warn!(parent: &self.span, "Removed leftover artifact on drop: {}", path.display())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    parent: &self.span,
                    "Failed to remove leftover artifact {}: {}",
                    path.display(),
                    e
                ),
            }
        }
    }
}
