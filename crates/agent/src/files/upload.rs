//! File upload channel.
//!
//! The target directory is created if needed and an existing file at the
//! target path is moved aside to a timestamped backup before the payload is
//! appended to a fresh file.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use protocol::TerminalStatus;
use thiserror::Error;
use tokio::fs::{self, DirBuilder, File, OpenOptions};

use crate::session::Session;

/// Mode of directories created for uploads.
pub const DIR_MODE: u32 = 0o775;

/// Mode of uploaded files.
pub const FILE_MODE: u32 = 0o644;

/// Timestamp layout of backup file names: date, then time to milliseconds.
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S%3f";

/// Errors that can occur while preparing an upload target.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The target path could not be made absolute.
    #[error("failed to resolve path: {0}")]
    Resolve(#[source] io::Error),

    /// The target directory could not be created.
    #[error("failed to make directory: {0}")]
    CreateDir(#[source] io::Error),

    /// The existing file could not be moved to its backup name.
    #[error("failed to rename file: {0}")]
    Backup(#[source] io::Error),

    /// The target file could not be opened.
    #[error("failed to open file: {0}")]
    Open(#[source] io::Error),
}

/// Destination of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTarget {
    directory: PathBuf,
    file_name: String,
}

impl TransferTarget {
    /// Create a target for `file_name` inside `directory`.
    pub fn new(directory: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            file_name: file_name.into(),
        }
    }

    /// The absolute directory.
    pub fn directory(&self) -> Result<PathBuf, UploadError> {
        std::path::absolute(&self.directory).map_err(UploadError::Resolve)
    }

    /// The absolute file path.
    pub fn path(&self) -> Result<PathBuf, UploadError> {
        Ok(self.directory()?.join(&self.file_name))
    }

    /// Create the directory, rotate any existing file and open a fresh file
    /// for appending.
    ///
    /// Returns the open file, its path and the backup path if a file was
    /// rotated.
    pub async fn prepare(&self) -> Result<(File, PathBuf, Option<PathBuf>), UploadError> {
        let directory = self.directory()?;
        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&directory)
            .await
            .map_err(UploadError::CreateDir)?;

        let path = directory.join(&self.file_name);
        let backup = match fs::try_exists(&path).await {
            Ok(true) => {
                let backup = backup_path(&path, Local::now());
                fs::rename(&path, &backup)
                    .await
                    .map_err(UploadError::Backup)?;
                tracing::info!(from = ?path, to = ?backup, "Existing file moved to backup");
                Some(backup)
            }
            _ => None,
        };

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(FILE_MODE)
            .open(&path)
            .await
            .map_err(UploadError::Open)?;

        Ok((file, path, backup))
    }
}

/// Backup name for `path`: `<path>_<timestamp>_bak`.
pub fn backup_path(path: &Path, now: DateTime<Local>) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!("_{}_bak", now.format(BACKUP_TIMESTAMP_FORMAT)));
    PathBuf::from(name)
}

/// Receive a payload into `directory/file_name`.
///
/// On failure the partially written file is left in place.
pub async fn upload(session: &mut Session, directory: &Path, file_name: &str) -> TerminalStatus {
    let target = TransferTarget::new(directory, file_name);

    let (mut file, path, _) = match target.prepare().await {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::error!(directory = ?directory, file_name = %file_name, error = %e, "Upload target unavailable");
            return TerminalStatus::InternalError(e.to_string());
        }
    };

    match session.receiver().copy_payload_to(&mut file).await {
        Ok(bytes) => {
            tracing::info!(path = ?path, bytes, "Upload complete");
            TerminalStatus::SUCCESS
        }
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Upload failed");
            TerminalStatus::InternalError(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    use chrono::TimeZone;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_backup_path_format() {
        let now = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap()
            + chrono::Duration::milliseconds(42);
        let backup = backup_path(Path::new("/data/app.conf"), now);
        assert_eq!(
            backup,
            PathBuf::from("/data/app.conf_2024-03-05-070809042_bak")
        );
    }

    #[test]
    fn test_target_path_is_absolute() {
        let target = TransferTarget::new("relative/dir", "file.txt");
        let path = target.path().unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("relative/dir/file.txt"));
    }

    #[tokio::test]
    async fn test_prepare_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let directory = temp_dir.path().join("a").join("b");
        let target = TransferTarget::new(&directory, "new.txt");

        let (_file, path, backup) = target.prepare().await.unwrap();

        assert!(directory.is_dir());
        assert_eq!(path, directory.join("new.txt"));
        assert!(path.exists());
        assert!(backup.is_none());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode & !FILE_MODE, 0, "unexpected mode {:o}", mode);
    }

    #[tokio::test]
    async fn test_prepare_rotates_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let existing = temp_dir.path().join("data.txt");
        std::fs::write(&existing, "old contents").unwrap();

        let target = TransferTarget::new(temp_dir.path(), "data.txt");
        let (mut file, path, backup) = target.prepare().await.unwrap();
        file.write_all(b"new contents").await.unwrap();
        file.flush().await.unwrap();

        let backup = backup.unwrap();
        let backup_name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(backup_name.starts_with("data.txt_"));
        assert!(backup_name.ends_with("_bak"));
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "old contents");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new contents");
    }

    #[tokio::test]
    async fn test_prepare_fails_when_directory_is_a_file() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();

        let target = TransferTarget::new(blocker.join("sub"), "x.txt");
        let err = target.prepare().await.unwrap_err();
        assert!(matches!(err, UploadError::CreateDir(_)));
        assert!(err.to_string().starts_with("failed to make directory: "));
    }
}
