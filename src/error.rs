//! Error kinds shared across the engine.
//!
//! The scanner recovers locally from per-file errors (`FileVanished`,
//! `PermissionDenied`, `Io`); the executor records failures per action and
//! keeps going. Everything else propagates to the caller.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HashallError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("file vanished: {}", .0.display())]
    FileVanished(PathBuf),
    #[error("cross-filesystem link refused: {} -> {}", .source_path.display(), .target_path.display())]
    CrossFilesystem {
        source_path: PathBuf,
        target_path: PathBuf,
    },
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("already hardlinked: {}", .0.display())]
    AlreadyLinked(PathBuf),
    #[error("ambiguous device: {0}")]
    AmbiguousDevice(String),
    #[error("unstable device identity: {0}")]
    UnstableIdentity(String),
    #[error("catalog busy: {0}")]
    StoreBusy(String),
    #[error("catalog corrupt: {0}")]
    StoreCorrupt(String),
    #[error("plan {0} is in a terminal state")]
    PlanTerminal(i64),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("rollback left a backup at {}", .0.display())]
    RollbackLeftBackup(PathBuf),
    #[error("catalog error: {0}")]
    Store(rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HashallError>;

impl From<rusqlite::Error> for HashallError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        if let rusqlite::Error::SqliteFailure(code, ref msg) = err {
            let detail = || msg.clone().unwrap_or_else(|| code.to_string());
            match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    return HashallError::StoreBusy(detail());
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    return HashallError::StoreCorrupt(detail());
                }
                _ => {}
            }
        }
        HashallError::Store(err)
    }
}

impl HashallError {
    /// Process exit code for the operator surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            HashallError::InvalidArgument(_) => 2,
            HashallError::Store(_) | HashallError::StoreBusy(_) | HashallError::StoreCorrupt(_) => {
                3
            }
            HashallError::PermissionDenied(_) => 4,
            HashallError::Io(err) if err.kind() == io::ErrorKind::PermissionDenied => 4,
            _ => 1,
        }
    }

    /// Whether the scanner may log this error and move on to the next file.
    pub fn is_per_file_recoverable(&self) -> bool {
        matches!(
            self,
            HashallError::FileVanished(_) | HashallError::PermissionDenied(_) | HashallError::Io(_)
        )
    }
}

/// Classify an I/O failure against a specific file path.
pub(crate) fn io_file_error(path: &std::path::Path, err: io::Error) -> HashallError {
    match err.kind() {
        io::ErrorKind::NotFound => HashallError::FileVanished(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => HashallError::PermissionDenied(path.to_path_buf()),
        _ => HashallError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_by_kind() {
        let path = std::path::Path::new("/nowhere/file");
        let gone = io_file_error(path, io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(gone, HashallError::FileVanished(_)));
        let denied = io_file_error(path, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(denied, HashallError::PermissionDenied(_)));
        assert_eq!(denied.exit_code(), 4);
    }

    #[test]
    fn exit_codes_follow_operator_contract() {
        assert_eq!(HashallError::InvalidArgument("x".into()).exit_code(), 2);
        assert_eq!(HashallError::StoreBusy("x".into()).exit_code(), 3);
        assert_eq!(HashallError::PlanTerminal(1).exit_code(), 1);
    }
}
