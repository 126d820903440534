// Scratch directory holding per-job input and output images.
//
// Layout:
//   <base>/uploads/<job-uuid>                 raw upload
//   <base>/processed/processed_<job-uuid>.png worker output

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const UPLOAD_DIR_NAME: &str = "uploads";
pub const PROCESSED_DIR_NAME: &str = "processed";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    upload_dir: PathBuf,
    processed_dir: PathBuf,
}

impl ArtifactStore {
    /// Opens (creating if needed) the scratch directories under `base_dir`.
    pub async fn open(base_dir: &Path) -> io::Result<Self> {
        let store = Self {
            upload_dir: base_dir.join(UPLOAD_DIR_NAME),
            processed_dir: base_dir.join(PROCESSED_DIR_NAME),
        };

        for dir in [&store.upload_dir, &store.processed_dir] {
            if fs::metadata(dir).await.is_err() {
                info!("Creating directory: {}", dir.display());
            }
            fs::create_dir_all(dir).await?;
        }

        Ok(store)
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed_dir
    }

    pub fn input_path(&self, job_id: Uuid) -> PathBuf {
        self.upload_dir.join(job_id.simple().to_string())
    }

    /// Output path derived from the input's file name.
    pub fn output_path_for(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        self.processed_dir.join(format!("processed_{}.png", stem))
    }

    /// Creates the job's input file. Fails if it already exists, so two jobs
    /// can never share a file.
    pub async fn create_input(&self, job_id: Uuid) -> io::Result<(PathBuf, fs::File)> {
        let path = self.input_path(job_id);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        debug!("Created input artifact {}", path.display());
        Ok((path, file))
    }

    /// Deletes an artifact. Deleting a missing file is not an error; the
    /// return value says whether anything was removed.
    pub async fn delete(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!("Successfully deleted file: {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deletes every given path, logging failures instead of stopping.
    /// Returns how many files were actually removed.
    pub async fn delete_all<P: AsRef<Path>>(&self, paths: &[P]) -> usize {
        let mut removed = 0;
        for path in paths {
            let path = path.as_ref();
            match self.delete(path).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Error deleting file {}: {}", path.display(), e),
            }
        }
        removed
    }

    /// Lists every file currently in the scratch directories.
    pub async fn list(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dir in [&self.upload_dir, &self.processed_dir] {
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    files.push(entry.path());
                }
            }
        }
        Ok(files)
    }

    /// Removes files left behind by a previous run (e.g. after a crash).
    /// Only call this before the server starts accepting jobs.
    pub async fn purge_stale(&self) -> io::Result<usize> {
        let stale = self.list().await?;
        if !stale.is_empty() {
            warn!(
                "Found {} stale artifact(s) from a previous run, removing",
                stale.len()
            );
        }
        Ok(self.delete_all(&stale).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::scratch_base;

    #[tokio::test]
    async fn test_open_creates_directories() {
        let base = scratch_base();
        let store = ArtifactStore::open(&base).await.unwrap();
        assert!(store.upload_dir().is_dir());
        assert!(store.processed_dir().is_dir());
        fs::remove_dir_all(&base).await.unwrap();
    }

    #[tokio::test]
    async fn test_output_name_derived_from_input() {
        let base = scratch_base();
        let store = ArtifactStore::open(&base).await.unwrap();
        let id = Uuid::new_v4();
        let input = store.input_path(id);
        let output = store.output_path_for(&input);
        assert_eq!(output.parent(), Some(store.processed_dir()));
        assert_eq!(
            output.file_name().unwrap().to_string_lossy(),
            format!("processed_{}.png", id.simple())
        );
        fs::remove_dir_all(&base).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_input_refuses_existing_file() {
        let base = scratch_base();
        let store = ArtifactStore::open(&base).await.unwrap();
        let id = Uuid::new_v4();
        let (path, _file) = store.create_input(id).await.unwrap();
        assert!(path.exists());
        let err = store.create_input(id).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        fs::remove_dir_all(&base).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let base = scratch_base();
        let store = ArtifactStore::open(&base).await.unwrap();
        let (path, file) = store.create_input(Uuid::new_v4()).await.unwrap();
        drop(file);

        assert!(store.delete(&path).await.unwrap());
        assert!(!store.delete(&path).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
        fs::remove_dir_all(&base).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_stale_empties_scratch() {
        let base = scratch_base();
        let store = ArtifactStore::open(&base).await.unwrap();
        let input = store.input_path(Uuid::new_v4());
        fs::write(&input, b"x").await.unwrap();
        fs::write(store.output_path_for(&input), b"y").await.unwrap();

        assert_eq!(store.purge_stale().await.unwrap(), 2);
        assert!(store.list().await.unwrap().is_empty());
        fs::remove_dir_all(&base).await.unwrap();
    }
}
