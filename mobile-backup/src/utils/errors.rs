//! Error types for reading, extracting and comparing backups.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Format error: {0}")]
    Format(String),

    #[error("Truncated record at offset {offset}: {detail}")]
    TruncatedRecord { offset: u64, detail: String },

    #[error("Not a backup directory: {}", .0.display())]
    NotABackup(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hard link unsupported ({}): {}", .errno, .target.display())]
    UnsupportedLink { target: PathBuf, errno: nix::errno::Errno },

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Unsafe path in record: {0}")]
    UnsafePath(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BackupError {
    /// Process exit status for this error kind. Success is 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::NotABackup(_) => 2,
            BackupError::Format(_) => 3,
            BackupError::TruncatedRecord { .. } => 4,
            BackupError::Io(_) => 5,
            BackupError::UnsupportedLink { .. } => 6,
            BackupError::Metadata(_) => 7,
            BackupError::Database(_) => 8,
            BackupError::UnsafePath(_) => 9,
            BackupError::Cancelled => 130,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
