//! Unified, read-only handle over a backup directory.
//!
//! [`Backup::load`] decides which manifest format the directory uses and
//! reads the descriptive plists. File records are never cached on the
//! handle: every call to [`Backup::records`] opens its own stream, so any
//! number of consumers can walk the same backup independently.

pub mod metadata;
pub mod storage;

use crate::manifest::database::{self, DatabaseRecords};
use crate::manifest::mbdb::{self, MbdbReader};
use crate::manifest::FileRecord;
use crate::utils::cancel::Cancellable;
use crate::utils::errors::{BackupError, Result};
use metadata::{ManifestInfo, StatusInfo, MANIFEST_PLIST, STATUS_PLIST};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MANIFEST_DB: &str = "Manifest.db";
pub const MANIFEST_MBDB: &str = "Manifest.mbdb";

/// Manifest format of a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackupType {
    /// `Manifest.mbdb` binary ledger
    LegacyBinary,
    /// `Manifest.db` SQLite database
    Relational,
}

impl BackupType {
    pub fn manifest_file(&self) -> &'static str {
        match self {
            BackupType::LegacyBinary => MANIFEST_MBDB,
            BackupType::Relational => MANIFEST_DB,
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::LegacyBinary => f.write_str("legacy (Manifest.mbdb)"),
            BackupType::Relational => f.write_str("relational (Manifest.db)"),
        }
    }
}

/// An opened backup directory
#[derive(Debug, Clone)]
pub struct Backup {
    backup_type: BackupType,
    root: PathBuf,
    manifest: ManifestInfo,
    status: StatusInfo,
}

impl Backup {
    /// Open the backup rooted at `path`.
    ///
    /// `Manifest.db` wins when both manifests exist. The chosen manifest is
    /// validated (header or schema) but no records are decoded.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(BackupError::NotABackup(path.to_path_buf()));
        }
        let root = path.canonicalize()?;

        let backup_type = detect_type(&root)?;
        let manifest = ManifestInfo::from_file(&root.join(MANIFEST_PLIST))?;
        let status = StatusInfo::from_file(&root.join(STATUS_PLIST))?;

        if manifest.is_encrypted {
            warn!(
                "Backup {} is encrypted; stored file contents are not decrypted",
                root.display()
            );
        }
        info!("Loaded {} backup at {}", backup_type, root.display());

        Ok(Self {
            backup_type,
            root,
            manifest,
            status,
        })
    }

    pub fn backup_type(&self) -> BackupType {
        self.backup_type
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &ManifestInfo {
        &self.manifest
    }

    pub fn status(&self) -> &StatusInfo {
        &self.status
    }

    pub fn storage(&self) -> Storage {
        Storage::new(self.backup_type, self.root.clone())
    }

    /// Fresh, independent stream over every record of the backup.
    pub fn records(&self) -> Result<Records> {
        let path = self.root.join(self.backup_type.manifest_file());
        match self.backup_type {
            BackupType::LegacyBinary => Ok(Records::Legacy(mbdb::open(&path)?)),
            BackupType::Relational => Ok(Records::Relational(DatabaseRecords::open(&path)?)),
        }
    }

    /// Like [`Backup::records`], stopping once `token` is cancelled.
    pub fn records_with_cancel(&self, token: CancellationToken) -> Result<Cancellable<Records>> {
        Ok(Cancellable::new(self.records()?, token))
    }
}

/// Check which manifests are present and usable.
fn detect_type(root: &Path) -> Result<BackupType> {
    let candidates = [BackupType::Relational, BackupType::LegacyBinary];
    let mut last_error = None;
    let mut present = 0;

    for backup_type in candidates {
        let path = root.join(backup_type.manifest_file());
        if !path.is_file() {
            continue;
        }
        present += 1;

        let probe = match backup_type {
            BackupType::LegacyBinary => mbdb::open(&path).map(|_| ()),
            BackupType::Relational => database::open(&path).map(|_| ()),
        };
        match probe {
            Ok(()) => return Ok(backup_type),
            Err(e) => {
                debug!("{} is unusable: {}", path.display(), e);
                last_error = Some(e);
            }
        }
    }

    match (present, last_error) {
        (1, Some(e)) => Err(e),
        _ => Err(BackupError::NotABackup(root.to_path_buf())),
    }
}

/// Record stream of either manifest format
pub enum Records {
    Legacy(MbdbReader<BufReader<File>>),
    Relational(DatabaseRecords),
}

impl Iterator for Records {
    type Item = Result<FileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Records::Legacy(reader) => reader.next(),
            Records::Relational(rows) => rows.next(),
        }
    }
}
