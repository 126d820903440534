// Entry point for cutout-server.
// Parses configuration, prepares the scratch directories and serves the
// upload API until a shutdown signal arrives.

mod pipeline;
mod shutdown_signal;
mod web;

use clap::{Parser, ValueEnum};
use pipeline::{ImagePipeline, PipelineSettings, TargetSize, UploadLimits, WorkerCommand};
use shutdown_signal::shutdown_signal;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::Level;
use web::{create_app, create_listener};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Scratch files in the working directory, worker run with `python`.
    Development,
    /// Scratch files in the system temp directory, worker run with `python3`.
    Production,
}

/// Command line arguments for cutout-server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct AppConfig {
    /// Hostname/IP to bind the server to.
    /// If this option is specified without value, it will default to "*", meaning the server will listen on all interfaces.
    #[arg(long, env = "CUTOUT_SERVER_HOST", default_value = "localhost", num_args = 0..=1, default_missing_value = "*")]
    host: String,

    /// Port number to listen on.
    #[arg(short, long, env = "CUTOUT_SERVER_PORT", default_value_t = 5000)]
    port: u16,

    /// Deployment mode. Picks the defaults for the scratch directory and worker interpreter.
    #[arg(long, env = "CUTOUT_SERVER_MODE", value_enum, default_value_t = Mode::Development)]
    mode: Mode,

    /// Base directory for `uploads/` and `processed/`.
    #[arg(long, env = "CUTOUT_SERVER_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// Executable that runs the background-removal worker.
    #[arg(long, env = "CUTOUT_SERVER_WORKER_PROGRAM")]
    worker_program: Option<String>,

    /// Leading arguments passed to the worker program, before the
    /// input path, output path, width and height.
    #[arg(
        long = "worker-arg",
        env = "CUTOUT_SERVER_WORKER_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_value = "worker/remove_background.py"
    )]
    worker_args: Vec<String>,

    /// Extra environment for the worker, as KEY=VALUE. Repeat the flag for
    /// several variables; values are taken verbatim, commas included.
    #[arg(
        long = "worker-env",
        env = "CUTOUT_SERVER_WORKER_ENV",
        value_parser = parse_key_val,
        default_value = "REMBG_MAX_MEMORY=450"
    )]
    worker_env: Vec<(String, String)>,

    /// Largest accepted upload in bytes.
    #[arg(long, env = "CUTOUT_SERVER_MAX_UPLOAD_BYTES", default_value_t = 5 * 1024 * 1024)]
    max_upload_bytes: u64,

    /// Largest accepted image width or height in pixels.
    #[arg(long, env = "CUTOUT_SERVER_MAX_DIMENSION", default_value_t = 2000)]
    max_dimension: u32,

    #[arg(long, env = "CUTOUT_SERVER_TARGET_WIDTH", default_value_t = 500)]
    target_width: u32,

    #[arg(long, env = "CUTOUT_SERVER_TARGET_HEIGHT", default_value_t = 500)]
    target_height: u32,

    /// Seconds a worker may run before it is killed.
    #[arg(long, env = "CUTOUT_SERVER_WORKER_TIMEOUT_SECS", default_value_t = 120)]
    worker_timeout_secs: u64,

    /// Workers allowed to run at once. 0 means unlimited.
    #[arg(long, env = "CUTOUT_SERVER_MAX_CONCURRENT_WORKERS", default_value_t = 2)]
    max_concurrent_workers: usize,

    /// Seconds a validated job waits for a worker slot before getting 503.
    #[arg(long, env = "CUTOUT_SERVER_ADMISSION_TIMEOUT_SECS", default_value_t = 30)]
    admission_timeout_secs: u64,

    /// Worker output retained per job for error reports.
    #[arg(long, env = "CUTOUT_SERVER_MAX_DIAGNOSTICS_BYTES", default_value_t = 64 * 1024)]
    max_diagnostics_bytes: usize,

    #[arg(long, env = "CUTOUT_SERVER_LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

impl AppConfig {
    fn scratch_dir(&self) -> PathBuf {
        match (&self.scratch_dir, self.mode) {
            (Some(dir), _) => dir.clone(),
            (None, Mode::Production) => std::env::temp_dir().join("cutout-server"),
            (None, Mode::Development) => PathBuf::from("."),
        }
    }

    fn worker_program(&self) -> String {
        match (&self.worker_program, self.mode) {
            (Some(program), _) => program.clone(),
            (None, Mode::Production) => "python3".to_string(),
            (None, Mode::Development) => "python".to_string(),
        }
    }

    fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            scratch_dir: self.scratch_dir(),
            limits: UploadLimits {
                max_upload_bytes: self.max_upload_bytes,
                max_dimension: self.max_dimension,
            },
            worker: WorkerCommand {
                program: self.worker_program().into(),
                args: self.worker_args.iter().map(Into::into).collect(),
                env: self.worker_env.clone(),
            },
            target: TargetSize {
                width: self.target_width,
                height: self.target_height,
            },
            worker_timeout: Duration::from_secs(self.worker_timeout_secs),
            max_concurrent_workers: self.max_concurrent_workers,
            admission_timeout: Duration::from_secs(self.admission_timeout_secs),
            max_diagnostics_bytes: self.max_diagnostics_bytes,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid KEY=VALUE: no `=` found in `{}`", s)),
    }
}

#[tokio::main]
async fn main() {
    let config = AppConfig::parse();

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Starting cutout-server in {:?} mode...", config.mode);

    let settings = config.pipeline_settings();
    tracing::info!(
        "Scratch directory: {}, worker: {:?} {:?}",
        settings.scratch_dir.display(),
        settings.worker.program,
        settings.worker.args
    );
    tracing::info!(
        "Limits: {} bytes, {}px max dimension, output {}x{}, worker timeout {:?}",
        settings.limits.max_upload_bytes,
        settings.limits.max_dimension,
        settings.target.width,
        settings.target.height,
        settings.worker_timeout
    );

    let pipeline = match ImagePipeline::new(settings).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::error!("FATAL: Failed to prepare scratch directories: {}", e);
            eprintln!("FATAL: Could not prepare scratch directories. Error: {}. Exiting.", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Upload directory: {}, processed directory: {}",
        pipeline.store().upload_dir().display(),
        pipeline.store().processed_dir().display()
    );

    match pipeline.store().purge_stale().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Removed {} stale file(s) from a previous run", n),
        Err(e) => tracing::warn!("Could not scan scratch directories for stale files: {}", e),
    }

    let app = create_app(Arc::new(pipeline));
    tracing::info!("Axum router configured.");
    tracing::info!("  GET  /                   -> redirect to upload page");
    tracing::info!("  GET  /test.html          -> upload page");
    tracing::info!("  POST /api/process-image  -> background removal");

    let listener = match create_listener(&config.host, config.port).await {
        Ok((addr, l)) => {
            tracing::info!("Server successfully bound. Listening on {}", addr);
            l
        }
        Err(e) => {
            tracing::error!("FATAL: Failed to bind server: {}", e);
            eprintln!("FATAL: Could not bind server. Error: {}. Exiting.", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server run error: {}", e);
        eprintln!("ERROR: Server shut down unexpectedly. Error: {}", e);
    }

    tracing::info!("cutout-server has shut down.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_development_mode() {
        let config = AppConfig::try_parse_from(["cutout-server"]).unwrap();
        let settings = config.pipeline_settings();

        assert_eq!(config.port, 5000);
        assert_eq!(settings.scratch_dir, PathBuf::from("."));
        assert_eq!(settings.worker.program, "python");
        assert_eq!(settings.worker.args, vec!["worker/remove_background.py"]);
        assert_eq!(
            settings.worker.env,
            vec![("REMBG_MAX_MEMORY".to_string(), "450".to_string())]
        );
        assert_eq!(settings.limits.max_upload_bytes, 5 * 1024 * 1024);
        assert_eq!(settings.limits.max_dimension, 2000);
        assert_eq!(settings.target, TargetSize::default());
        assert_eq!(settings.worker_timeout, Duration::from_secs(120));
        assert_eq!(settings.max_concurrent_workers, 2);
    }

    #[test]
    fn test_production_mode_defaults() {
        let config =
            AppConfig::try_parse_from(["cutout-server", "--mode", "production"]).unwrap();
        assert_eq!(config.worker_program(), "python3");
        assert!(config.scratch_dir().starts_with(std::env::temp_dir()));
    }

    #[test]
    fn test_explicit_values_override_mode() {
        let config = AppConfig::try_parse_from([
            "cutout-server",
            "--mode",
            "production",
            "--scratch-dir",
            "/srv/scratch",
            "--worker-program",
            "/opt/venv/bin/python",
            "--worker-arg",
            "-u",
            "--worker-arg",
            "remove.py",
            "--worker-env",
            "REMBG_MAX_MEMORY=1024",
            "--worker-env",
            "OMP_NUM_THREADS=1",
        ])
        .unwrap();
        let settings = config.pipeline_settings();

        assert_eq!(settings.scratch_dir, PathBuf::from("/srv/scratch"));
        assert_eq!(settings.worker.program, "/opt/venv/bin/python");
        assert_eq!(settings.worker.args, vec!["-u", "remove.py"]);
        assert_eq!(settings.worker.env.len(), 2);
        assert_eq!(settings.worker.env[1], ("OMP_NUM_THREADS".into(), "1".into()));
    }

    #[test]
    fn test_worker_env_value_keeps_commas() {
        let config = AppConfig::try_parse_from([
            "cutout-server",
            "--worker-env",
            "REMBG_MODELS=u2net,isnet",
        ])
        .unwrap();
        assert_eq!(
            config.worker_env,
            vec![("REMBG_MODELS".to_string(), "u2net,isnet".to_string())]
        );
    }

    #[test]
    fn test_worker_arg_accepts_interpreter_flags() {
        let config = AppConfig::try_parse_from([
            "cutout-server",
            "--worker-arg",
            "-u",
            "--worker-arg",
            "-X",
            "--worker-arg",
            "utf8",
        ])
        .unwrap();
        assert_eq!(config.worker_args, vec!["-u", "-X", "utf8"]);
    }

    #[test]
    fn test_bare_host_flag_means_all_interfaces() {
        let config = AppConfig::try_parse_from(["cutout-server", "--host"]).unwrap();
        assert_eq!(config.host, "*");
    }

    #[test]
    fn test_rejects_malformed_worker_env() {
        assert!(AppConfig::try_parse_from(["cutout-server", "--worker-env", "NOEQUALS"]).is_err());
        assert!(parse_key_val("=value").is_err());
        assert_eq!(
            parse_key_val("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
    }
}
