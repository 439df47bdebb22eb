//! Backup comparison.

pub mod compare;
pub mod diff;

pub use diff::{
    changed_files, extract_changed_and_removed, BackupDiff, ChangeKind, ChangedFile, ChangedFiles,
};
