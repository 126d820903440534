// Shared fixtures for pipeline and web tests.

use super::supervisor::WorkerCommand;
use std::io::Cursor;
use std::path::PathBuf;
use uuid::Uuid;

/// Fresh, not yet created, scratch base under the system temp dir.
pub fn scratch_base() -> PathBuf {
    std::env::temp_dir().join(format!("cutout-server-test-{}", Uuid::new_v4()))
}

/// Encodes a small gradient image of the given size.
pub fn encode_image(width: u32, height: u32, format: image::ImageFormat) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, format).unwrap();
    buffer.into_inner()
}

/// A worker that runs `script` under `sh`. Inside the script `$1..$4` are
/// input path, output path, width and height.
pub fn sh_worker(script: &str) -> WorkerCommand {
    WorkerCommand {
        program: "sh".into(),
        args: vec!["-c".into(), script.into(), "cutout-worker".into()],
        env: vec![("REMBG_MAX_MEMORY".into(), "450".into())],
    }
}

/// Shell snippet that copies `fixture` to the worker's output path.
pub fn copy_fixture_script(fixture: &std::path::Path) -> String {
    format!("cp '{}' \"$2\"", fixture.display())
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
