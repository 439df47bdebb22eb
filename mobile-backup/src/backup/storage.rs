//! Location of a file's data inside the backup directory.
//!
//! Data files are named by fileID. Legacy backups keep them flat in the
//! backup root; `Manifest.db` backups shard them into sub-directories named
//! after the first two hex characters of the fileID.

use crate::backup::BackupType;
use std::path::{Path, PathBuf};

/// Path of the stored data for `file_id`. No filesystem access.
pub fn storage_path_for(backup_type: BackupType, root: &Path, file_id: &str) -> PathBuf {
    match backup_type {
        BackupType::LegacyBinary => root.join(file_id),
        BackupType::Relational => match file_id.get(..2) {
            Some(shard) => root.join(shard).join(file_id),
            None => root.join(file_id),
        },
    }
}

/// Backup type and root, enough to resolve any record's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    pub backup_type: BackupType,
    pub root: PathBuf,
}

impl Storage {
    pub fn new(backup_type: BackupType, root: impl Into<PathBuf>) -> Self {
        Self {
            backup_type,
            root: root.into(),
        }
    }

    pub fn path_for(&self, file_id: &str) -> PathBuf {
        storage_path_for(self.backup_type, &self.root, file_id)
    }
}
