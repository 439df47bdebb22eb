//! File records shared by both manifest formats.
//!
//! A backup lists every filesystem entry it captured as a [`FileRecord`].
//! Legacy backups store them in the length-prefixed `Manifest.mbdb` ledger
//! ([`mbdb`]), newer ones in the `Files` table of `Manifest.db`
//! ([`database`]). Both decoders produce the same record shape.

pub mod database;
pub mod keyed_archive;
pub mod mbdb;
pub mod timestamps;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;

/// POSIX file type mask and the three types a backup can contain.
const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Extended attributes as stored by the backup: name to raw value.
pub type ExtendedAttributes = BTreeMap<String, Vec<u8>>;

/// Kind of filesystem entry a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
}

impl FileType {
    /// Classify the type bits of a POSIX mode, `None` for anything else.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(FileType::RegularFile),
            S_IFDIR => Some(FileType::Directory),
            S_IFLNK => Some(FileType::Symlink),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::RegularFile => "RegularFile",
            FileType::Directory => "Directory",
            FileType::Symlink => "Symlink",
        };
        f.write_str(name)
    }
}

/// Identity of a file within a backup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub domain: String,
    pub relative_path: String,
}

/// One filesystem entry captured in a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Storage key, lowercase hex SHA-1 of `"{domain}-{relative_path}"`
    pub file_id: String,

    /// Logical category (app bundle id, `HomeDomain`, ...)
    pub domain: String,

    /// Path inside the domain; empty for the domain root
    pub relative_path: String,

    pub file_type: FileType,

    pub uid: u32,
    pub gid: u32,

    /// POSIX mode, type and permission bits combined
    pub mode: u32,

    /// Inode on the source device, informational only
    pub inode: u64,

    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,

    /// Creation ("birth") time
    pub btime: DateTime<Utc>,

    /// Byte length for regular files
    pub size: u64,

    /// Data protection class, 0 when unset
    pub protection: u32,

    #[serde(skip_serializing)]
    pub extended_attributes: Option<ExtendedAttributes>,

    /// Only for symlinks
    pub link_target: Option<String>,

    /// Precomputed content hash (lowercase hex) when the format stores one
    pub digest: Option<String>,
}

impl FileRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            domain: self.domain.clone(),
            relative_path: self.relative_path.clone(),
        }
    }

    /// Permission bits (low 12 bits of the mode)
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Digest usable for content comparison, if any.
    pub fn usable_digest(&self) -> Option<&str> {
        self.digest.as_deref().filter(|d| !d.is_empty())
    }
}

/// Storage key of a file: hex SHA-1 over `"{domain}-{relative_path}"`.
pub fn file_id(domain: &str, relative_path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(domain.as_bytes());
    hasher.update(b"-");
    hasher.update(relative_path.as_bytes());
    hex::encode(hasher.finalize())
}

/// File type for a decoded mode. Unknown type bits are kept as regular
/// files so a single odd entry does not stop a decode.
pub(crate) fn file_type_for(mode: u32, domain: &str, relative_path: &str) -> FileType {
    FileType::from_mode(mode).unwrap_or_else(|| {
        tracing::warn!(
            "Unrecognized type bits in mode {:#o} for {}-{}, treating as regular file",
            mode,
            domain,
            relative_path
        );
        FileType::RegularFile
    })
}
