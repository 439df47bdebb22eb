//! Mobile Backup Library
//!
//! Reads the on-disk backups a phone writes to a computer, extracts their
//! files into an ordinary directory tree and compares two backups of the
//! same device.

pub mod backup;
pub mod config;
pub mod executor;
pub mod inspect;
pub mod manifest;
pub mod sync;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use backup::{Backup, BackupType};
pub use config::Config;
pub use executor::{extract, extract_subset, Extractor, LinkMode};
pub use manifest::{file_id, FileRecord, FileType};
pub use sync::{changed_files, extract_changed_and_removed, BackupDiff};
pub use utils::errors::{BackupError, Result};
