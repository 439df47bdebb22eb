//! Comparison of two backups of the same device.
//!
//! Records are aligned by `(domain, relative_path)`. The first backup is
//! indexed in memory, the second is streamed once against that index:
//!
//! - key only in the second backup: added, yielded as `(None, Some(b))`
//! - key in both with different content: yielded as `(Some(a), Some(b))`
//! - key left in the index after the stream: removed, `(Some(a), None)`,
//!   yielded last in key order
//!
//! Keys with identical content produce nothing.

use crate::backup::storage::Storage;
use crate::backup::{Backup, Records};
use crate::executor::{ExtractSummary, Extractor, LinkMode};
use crate::manifest::{FileRecord, RecordKey};
use crate::sync::compare::{same_content, DEFAULT_BUFFER_SIZE};
use crate::utils::errors::{BackupError, Result};
use std::collections::btree_map::{BTreeMap, IntoIter};
use std::io;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a key differs between the two backups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

/// One differing key. At least one side is present.
#[derive(Debug)]
pub struct ChangedFile {
    /// Record in the first backup
    pub a: Option<FileRecord>,
    /// Record in the second backup
    pub b: Option<FileRecord>,
    /// Set when stored data could not be read; the pair is then reported
    /// as changed because it cannot be shown to be identical.
    pub compare_error: Option<io::Error>,
}

impl ChangedFile {
    pub fn kind(&self) -> ChangeKind {
        match (&self.a, &self.b) {
            (None, _) => ChangeKind::Added,
            (_, None) => ChangeKind::Removed,
            _ => ChangeKind::Changed,
        }
    }

    pub fn key(&self) -> Option<RecordKey> {
        self.a.as_ref().or(self.b.as_ref()).map(FileRecord::key)
    }
}

/// Diff of two backups
pub struct BackupDiff<'a> {
    a: &'a Backup,
    b: &'a Backup,
    buffer_size: usize,
    cancel_token: CancellationToken,
}

impl<'a> BackupDiff<'a> {
    pub fn new(a: &'a Backup, b: &'a Backup) -> Self {
        Self::with_cancel(a, b, CancellationToken::new())
    }

    pub fn with_cancel(a: &'a Backup, b: &'a Backup, cancel_token: CancellationToken) -> Self {
        Self {
            a,
            b,
            buffer_size: DEFAULT_BUFFER_SIZE,
            cancel_token,
        }
    }

    /// Chunk size used when stored bytes have to be compared
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Index the first backup, then return the lazy stream of differences.
    pub fn changed_files(&self) -> Result<ChangedFiles> {
        let mut index = BTreeMap::new();
        for record in self.a.records()? {
            if self.cancel_token.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let record = record?;
            if let Some(previous) = index.insert(record.key(), record) {
                debug!(
                    "Duplicate key {}-{} in {}",
                    previous.domain,
                    previous.relative_path,
                    self.a.root().display()
                );
            }
        }
        info!(
            "Indexed {} records of {}, comparing against {}",
            index.len(),
            self.a.root().display(),
            self.b.root().display()
        );

        Ok(ChangedFiles {
            index,
            residual: None,
            b_records: self.b.records()?,
            a_storage: self.a.storage(),
            b_storage: self.b.storage(),
            buffer_size: self.buffer_size,
            cancel_token: self.cancel_token.clone(),
            finished: false,
        })
    }

    /// Extract from the first backup every file that is gone from, or
    /// different in, the second one.
    pub fn extract_changed_and_removed(
        &self,
        out: &Path,
        extractor: &Extractor,
    ) -> Result<ExtractSummary> {
        let records = self.changed_files()?.filter_map(|change| match change {
            Ok(change) => change.a.map(Ok),
            Err(e) => Some(Err(e)),
        });
        extractor.extract_subset(&self.a.storage(), records, out, |_| {})
    }
}

/// Differences between `a` and `b`.
pub fn changed_files(a: &Backup, b: &Backup) -> Result<ChangedFiles> {
    BackupDiff::new(a, b).changed_files()
}

/// Extract from `a` what is removed or changed in `b`.
pub fn extract_changed_and_removed(
    a: &Backup,
    b: &Backup,
    out: &Path,
    mode: LinkMode,
) -> Result<ExtractSummary> {
    BackupDiff::new(a, b).extract_changed_and_removed(out, &Extractor::new(mode))
}

/// Lazy stream of [`ChangedFile`]s
pub struct ChangedFiles {
    index: BTreeMap<RecordKey, FileRecord>,
    residual: Option<IntoIter<RecordKey, FileRecord>>,
    b_records: Records,
    a_storage: Storage,
    b_storage: Storage,
    buffer_size: usize,
    cancel_token: CancellationToken,
    finished: bool,
}

impl ChangedFiles {
    fn compare(&self, a: FileRecord, b: FileRecord) -> Option<ChangedFile> {
        match same_content(&a, &self.a_storage, &b, &self.b_storage, self.buffer_size) {
            Ok(true) => None,
            Ok(false) => Some(ChangedFile {
                a: Some(a),
                b: Some(b),
                compare_error: None,
            }),
            Err(e) => {
                warn!("Cannot compare {}-{}: {}", a.domain, a.relative_path, e);
                Some(ChangedFile {
                    a: Some(a),
                    b: Some(b),
                    compare_error: Some(e),
                })
            }
        }
    }
}

impl Iterator for ChangedFiles {
    type Item = Result<ChangedFile>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel_token.is_cancelled() {
                self.finished = true;
                return Some(Err(BackupError::Cancelled));
            }

            if let Some(residual) = &mut self.residual {
                return match residual.next() {
                    Some((_, a)) => Some(Ok(ChangedFile {
                        a: Some(a),
                        b: None,
                        compare_error: None,
                    })),
                    None => {
                        self.finished = true;
                        None
                    }
                };
            }

            match self.b_records.next() {
                None => {
                    self.residual = Some(std::mem::take(&mut self.index).into_iter());
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Some(Ok(b)) => match self.index.remove(&b.key()) {
                    None => {
                        return Some(Ok(ChangedFile {
                            a: None,
                            b: Some(b),
                            compare_error: None,
                        }))
                    }
                    Some(a) => {
                        if let Some(change) = self.compare(a, b) {
                            return Some(Ok(change));
                        }
                    }
                },
            }
        }
    }
}
