//! Artifact archiving
//!
//! Loader artifacts are never deleted. After a successful load the control,
//! data and log files go to `<archive-dir>/<correlation-id>/`; bad and
//! discard files, and everything from a failed load, go to
//! `<error-dir>/<correlation-id>/`.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::LoaderError;
use super::control::ArtifactPaths;

/// Moves loader artifacts out of the temp directory
#[derive(Debug, Clone)]
pub struct ArtifactArchiver {
    archive_dir: PathBuf,
    error_dir: PathBuf,
}

impl ArtifactArchiver {
    pub fn new(archive_dir: impl Into<PathBuf>, error_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            error_dir: error_dir.into(),
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn error_dir(&self) -> &Path {
        &self.error_dir
    }

    /// Archive the artifacts of a load that reached the database
    pub async fn archive_success(&self, paths: &ArtifactPaths, correlation_id: &str) -> Result<Vec<PathBuf>, LoaderError> {
        debug!(%correlation_id, "ArtifactArchiver::archive_success: called");
        let archive = self.archive_dir.join(correlation_id);
        let errors = self.error_dir.join(correlation_id);
        let mut moved = Vec::new();
        for file in [&paths.control_file, &paths.data_file, &paths.log_file] {
            moved.extend(move_into(file, &archive).await?);
        }
        for file in [&paths.bad_file, &paths.discard_file] {
            moved.extend(move_into(file, &errors).await?);
        }
        info!(%correlation_id, files = moved.len(), "Archived loader artifacts");
        Ok(moved)
    }

    /// Move every artifact of a failed load to the error directory
    pub async fn archive_failure(&self, paths: &ArtifactPaths, correlation_id: &str) -> Result<Vec<PathBuf>, LoaderError> {
        debug!(%correlation_id, "ArtifactArchiver::archive_failure: called");
        let errors = self.error_dir.join(correlation_id);
        let mut moved = Vec::new();
        for file in paths.all() {
            moved.extend(move_into(file, &errors).await?);
        }
        warn!(%correlation_id, files = moved.len(), dir = %errors.display(), "Moved failed load artifacts");
        Ok(moved)
    }
}

/// Move `file` into `dir`, if it exists
async fn move_into(file: &Path, dir: &Path) -> Result<Option<PathBuf>, LoaderError> {
    if !tokio::fs::try_exists(file).await? {
        return Ok(None);
    }
    let Some(name) = file.file_name() else {
        return Ok(None);
    };
    tokio::fs::create_dir_all(dir).await?;
    let dest = dir.join(name);
    if tokio::fs::rename(file, &dest).await.is_err() {
        // rename fails across filesystems
        tokio::fs::copy(file, &dest).await?;
        tokio::fs::remove_file(file).await?;
    }
    debug!(from = %file.display(), to = %dest.display(), "move_into: moved");
    Ok(Some(dest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CorrelationId;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (ArtifactArchiver, ArtifactPaths) {
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        let paths = ArtifactPaths::in_dir(&tmp, &CorrelationId::from("job-1"));
        for file in [&paths.control_file, &paths.data_file, &paths.log_file, &paths.bad_file] {
            std::fs::write(file, "x").unwrap();
        }
        let archiver = ArtifactArchiver::new(dir.path().join("archive"), dir.path().join("error"));
        (archiver, paths)
    }

    #[tokio::test]
    async fn test_archive_success() {
        let dir = TempDir::new().unwrap();
        let (archiver, paths) = setup(&dir);
        let moved = archiver.archive_success(&paths, "job-1").await.unwrap();
        assert_eq!(moved.len(), 4);
        assert!(dir.path().join("archive/job-1/job-1.ctl").exists());
        assert!(dir.path().join("archive/job-1/job-1.dat").exists());
        assert!(dir.path().join("archive/job-1/job-1.log").exists());
        assert!(dir.path().join("error/job-1/job-1.bad").exists());
        assert!(!dir.path().join("error/job-1/job-1.dsc").exists());
        assert!(!paths.control_file.exists());
    }

    #[tokio::test]
    async fn test_archive_failure() {
        let dir = TempDir::new().unwrap();
        let (archiver, paths) = setup(&dir);
        archiver.archive_failure(&paths, "job-1").await.unwrap();
        assert!(dir.path().join("error/job-1/job-1.ctl").exists());
        assert!(dir.path().join("error/job-1/job-1.log").exists());
        assert!(!dir.path().join("archive").exists());
    }
}
