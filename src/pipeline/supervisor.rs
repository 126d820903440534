// Runs the external transform worker for one job and reports a single outcome.
//
// The worker is invoked as
//   <program> [args...] <input-path> <output-path> <width> <height>
// with every value passed as its own argv entry. Nothing is interpolated
// into source code or a shell command line.

use super::diagnostics::StreamKind;
use super::error::JobError;
use super::job::{Job, JobState};
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// Longest single diagnostic line forwarded; longer lines are split.
const MAX_LINE_BYTES: usize = 8 * 1024;
// How long to keep reading worker output after it exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How to launch the worker executable.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl Default for TargetSize {
    fn default() -> Self {
        Self {
            width: 500,
            height: 500,
        }
    }
}

#[derive(Debug)]
pub enum WorkerFailure {
    Exit(ExitStatus),
    OutputMissing,
}

/// What happened to one worker invocation.
#[derive(Debug)]
pub enum WorkerOutcome {
    Success { output_bytes: u64 },
    WorkerFailure(WorkerFailure),
    SpawnFailure(std::io::Error),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct WorkerSupervisor {
    command: WorkerCommand,
    target: TargetSize,
    timeout: Duration,
}

impl WorkerSupervisor {
    pub fn new(command: WorkerCommand, target: TargetSize, timeout: Duration) -> Self {
        Self {
            command,
            target,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Launches the worker for `job` and waits for it to exit or for the
    /// deadline, whichever comes first. The job is left in its terminal
    /// state (`Succeeded`, `Failed` or `TimedOut`).
    pub async fn run(&self, job: &mut Job) -> WorkerOutcome {
        let outcome = self.execute(job).await;
        let state = match &outcome {
            WorkerOutcome::Success { output_bytes } => {
                job.mark_output_ready(*output_bytes);
                job.diagnostics_mut().clear();
                JobState::Succeeded
            }
            WorkerOutcome::TimedOut => JobState::TimedOut,
            WorkerOutcome::WorkerFailure(_) | WorkerOutcome::SpawnFailure(_) => JobState::Failed,
        };
        if let Err(e) = job.transition(state) {
            error!("Worker outcome could not be recorded: {}", e);
        }
        outcome
    }

    async fn execute(&self, job: &mut Job) -> WorkerOutcome {
        let (input_path, output_path) = match (job.input(), job.output()) {
            (Some(input), Some(output)) => (input.path.clone(), output.path.clone()),
            _ => {
                return WorkerOutcome::SpawnFailure(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "job has no input/output artifact assigned",
                ));
            }
        };

        if let Err(e) = job.transition(JobState::Executing) {
            return WorkerOutcome::SpawnFailure(std::io::Error::other(e));
        }

        let mut command = self.build_command(&input_path, &output_path);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    "Failed to start worker process {:?}: {}",
                    self.command.program, e
                );
                return WorkerOutcome::SpawnFailure(e);
            }
        };

        let deadline = Instant::now() + self.timeout;
        job.set_deadline(deadline);
        info!(
            pid = ?child.id(),
            "Worker started, deadline in {}s",
            self.timeout.as_secs()
        );

        let (tx, mut rx) = mpsc::channel::<(StreamKind, String)>(64);
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, StreamKind::Stderr, tx.clone()));
        }
        drop(tx);

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        // Whichever of exit/deadline is observed first decides the outcome.
        let exit = loop {
            tokio::select! {
                biased;
                status = child.wait() => break Some(status),
                Some((kind, line)) = rx.recv() => record_line(job, kind, &line),
                _ = &mut sleep => break None,
            }
        };

        let status = match exit {
            Some(status) => status,
            None => {
                warn!(
                    deadline = ?job.deadline(),
                    "Worker exceeded deadline of {}s, killing it",
                    self.timeout.as_secs()
                );
                if let Err(e) = child.start_kill() {
                    // Already gone between the deadline firing and the kill.
                    debug!("Kill after deadline failed: {}", e);
                }
                // Reap so the process is really gone before we respond.
                match child.wait().await {
                    Ok(late) => debug!("Killed worker reaped ({}), ignoring its status", late),
                    Err(e) => warn!("Failed to reap killed worker: {}", e),
                }
                for reader in &readers {
                    reader.abort();
                }
                while let Ok((kind, line)) = rx.try_recv() {
                    record_line(job, kind, &line);
                }
                return WorkerOutcome::TimedOut;
            }
        };

        // Collect the tail of its output; pipes held open by orphaned
        // grandchildren must not stall the response.
        let drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
            while let Some((kind, line)) = rx.recv().await {
                record_line(job, kind, &line);
            }
        })
        .await;
        if drained.is_err() {
            warn!("Worker output still open after exit, abandoning it");
        }
        for reader in &readers {
            reader.abort();
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                error!("Failed to wait for worker process: {}", e);
                return WorkerOutcome::SpawnFailure(e);
            }
        };

        info!(
            diagnostics_bytes = job.diagnostics().len_bytes(),
            "Worker process exited with {}",
            describe_exit(&status)
        );
        if !status.success() {
            return WorkerOutcome::WorkerFailure(WorkerFailure::Exit(status));
        }

        match tokio::fs::metadata(&output_path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => WorkerOutcome::Success {
                output_bytes: meta.len(),
            },
            _ => {
                error!(
                    "Output file not found or empty: {}",
                    output_path.display()
                );
                WorkerOutcome::WorkerFailure(WorkerFailure::OutputMissing)
            }
        }
    }

    fn build_command(&self, input: &Path, output: &Path) -> Command {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .arg(input)
            .arg(output)
            .arg(self.target.width.to_string())
            .arg(self.target.height.to_string())
            .env("PYTHONUNBUFFERED", "1")
            .envs(self.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl WorkerOutcome {
    /// Folds the outcome into the job's result, attaching diagnostics to
    /// failures.
    pub fn into_result(self, job: &Job, timeout: Duration) -> Result<u64, JobError> {
        match self {
            Self::Success { output_bytes } => Ok(output_bytes),
            Self::SpawnFailure(e) => Err(JobError::Spawn(e)),
            Self::TimedOut => Err(JobError::TimedOut { timeout }),
            Self::WorkerFailure(WorkerFailure::OutputMissing) => Err(JobError::OutputMissing {
                diagnostics: job.diagnostics().text(),
            }),
            Self::WorkerFailure(WorkerFailure::Exit(status)) => {
                let exit = describe_exit(&status);
                let summary = job
                    .diagnostics()
                    .summary()
                    .unwrap_or_else(|| format!("worker terminated with {}", exit));
                let diagnostics = if job.diagnostics().is_empty() {
                    format!("worker produced no output and terminated with {}", exit)
                } else {
                    job.diagnostics().stderr_text()
                };
                Err(JobError::WorkerFailed {
                    exit,
                    summary,
                    diagnostics,
                })
            }
        }
    }
}

fn record_line(job: &mut Job, kind: StreamKind, line: &str) {
    match kind {
        StreamKind::Stdout => debug!("Worker stdout: {}", line),
        StreamKind::Stderr => warn!("Worker stderr: {}", line),
    }
    job.diagnostics_mut().push(kind, line);
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {}", signal);
        }
    }
    status.to_string()
}

/// Forwards a worker stream line by line, splitting overlong lines so a
/// worker that never prints a newline cannot grow our memory without bound.
fn spawn_line_reader<R>(
    stream: R,
    kind: StreamKind,
    tx: mpsc::Sender<(StreamKind, String)>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line: Vec<u8> = Vec::new();
        loop {
            let (used, complete, eof) = match reader.fill_buf().await {
                Ok([]) => (0, false, true),
                Ok(buf) => match buf.iter().position(|b| *b == b'\n') {
                    Some(idx) => {
                        line.extend_from_slice(&buf[..idx]);
                        (idx + 1, true, false)
                    }
                    None => {
                        let take = buf.len().min(MAX_LINE_BYTES.saturating_sub(line.len()).max(1));
                        line.extend_from_slice(&buf[..take]);
                        (take, line.len() >= MAX_LINE_BYTES, false)
                    }
                },
                Err(e) => {
                    let _ = tx
                        .send((kind, format!("<failed to read worker output: {}>", e)))
                        .await;
                    break;
                }
            };
            reader.consume(used);

            if complete || (eof && !line.is_empty()) {
                let text = String::from_utf8_lossy(&line).into_owned();
                line.clear();
                if tx.send((kind, text)).await.is_err() {
                    break;
                }
            }
            if eof {
                break;
            }
        }
    })
}
