//! Extraction of backup records into a plain directory tree.
//!
//! Records land at `<out>/<domain>/<relative_path>`. Regular files are
//! copied or hard-linked from backup storage, directories are created,
//! symlinks are recreated from their link target. The backup itself is never
//! written to.
//!
//! A failing record (missing data, permission problem, unsafe path) is
//! reported in the [`ExtractSummary`] and extraction carries on. Errors of
//! the record stream itself (corrupt manifest) abort the run.

use crate::backup::storage::Storage;
use crate::backup::{Backup, BackupType};
use crate::manifest::{FileRecord, FileType};
use crate::utils::errors::{BackupError, Result};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default permission bits for directories created in the output tree
pub const DEFAULT_DIR_MODE: u32 = 0o750;

/// How regular file data reaches the output tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    #[default]
    Copy,
    Hardlink,
}

/// What happened to one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractAction {
    Copied { bytes: u64 },
    Linked,
    /// Hard link was refused by the filesystem; data was copied instead
    CopiedAfterLinkFailure { bytes: u64 },
    /// Target already is a hard link to the stored data
    AlreadyLinked,
    CreatedEmpty,
    CreatedDirectory,
    CreatedSymlink,
    Skipped(&'static str),
}

/// Result of extracting a single record
#[derive(Debug)]
pub struct ExtractOutcome {
    pub domain: String,
    pub relative_path: String,
    pub target: PathBuf,
    pub result: Result<ExtractAction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractFailure {
    pub domain: String,
    pub relative_path: String,
    pub error: String,
}

/// Totals of an extraction run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub skipped: usize,
    pub bytes: u64,
    pub link_fallbacks: usize,
    pub failures: Vec<ExtractFailure>,
    pub cancelled: bool,
}

impl ExtractSummary {
    pub fn succeeded(&self) -> usize {
        self.files + self.directories + self.symlinks
    }

    fn record(&mut self, outcome: &ExtractOutcome) {
        match &outcome.result {
            Ok(ExtractAction::Copied { bytes }) => {
                self.files += 1;
                self.bytes += bytes;
            }
            Ok(ExtractAction::CopiedAfterLinkFailure { bytes }) => {
                self.files += 1;
                self.bytes += bytes;
                self.link_fallbacks += 1;
            }
            Ok(
                ExtractAction::Linked | ExtractAction::AlreadyLinked | ExtractAction::CreatedEmpty,
            ) => {
                self.files += 1;
            }
            Ok(ExtractAction::CreatedDirectory) => self.directories += 1,
            Ok(ExtractAction::CreatedSymlink) => self.symlinks += 1,
            Ok(ExtractAction::Skipped(_)) => self.skipped += 1,
            Err(e) => self.failures.push(ExtractFailure {
                domain: outcome.domain.clone(),
                relative_path: outcome.relative_path.clone(),
                error: e.to_string(),
            }),
        }
    }
}

/// Writes records into an output tree
#[derive(Debug, Clone)]
pub struct Extractor {
    mode: LinkMode,
    dir_mode: u32,
    cancel_token: CancellationToken,
}

impl Extractor {
    /// Create an extractor (no cancellation support)
    pub fn new(mode: LinkMode) -> Self {
        Self {
            mode,
            dir_mode: DEFAULT_DIR_MODE,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Create an extractor that stops between records once `cancel_token` fires
    pub fn with_cancel(mode: LinkMode, cancel_token: CancellationToken) -> Self {
        Self {
            mode,
            dir_mode: DEFAULT_DIR_MODE,
            cancel_token,
        }
    }

    /// Permission bits for created directories
    pub fn dir_mode(mut self, dir_mode: u32) -> Self {
        self.dir_mode = dir_mode & 0o7777;
        self
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    /// Extract every record of `backup`.
    pub fn extract(&self, backup: &Backup, out: &Path) -> Result<ExtractSummary> {
        self.extract_subset(&backup.storage(), backup.records()?, out, |_| {})
    }

    /// Extract a caller-chosen sequence of records, reporting each outcome
    /// to `callback` as it happens.
    pub fn extract_subset<I, F>(
        &self,
        storage: &Storage,
        records: I,
        out: &Path,
        mut callback: F,
    ) -> Result<ExtractSummary>
    where
        I: IntoIterator<Item = Result<FileRecord>>,
        F: FnMut(&ExtractOutcome),
    {
        fs::create_dir_all(out)?;
        info!(
            "Extracting from {} into {} ({:?})",
            storage.root.display(),
            out.display(),
            self.mode
        );

        let mut summary = ExtractSummary::default();
        for record in records {
            if self.cancel_token.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let record = match record {
                Ok(record) => record,
                Err(BackupError::Cancelled) => {
                    summary.cancelled = true;
                    break;
                }
                Err(e) => return Err(e),
            };

            let outcome = self.extract_record(storage, &record, out);
            if let Err(e) = &outcome.result {
                warn!("Failed to extract {}-{}: {}", record.domain, record.relative_path, e);
            }
            summary.record(&outcome);
            callback(&outcome);
        }

        let state = match summary.cancelled {
            true => "cancelled",
            false => "finished",
        };
        info!(
            "Extraction {}: {} files, {} directories, {} symlinks, {} bytes, {} failures",
            state,
            summary.files,
            summary.directories,
            summary.symlinks,
            summary.bytes,
            summary.failures.len()
        );
        Ok(summary)
    }

    /// Extract one record below `out`.
    pub fn extract_record(
        &self,
        storage: &Storage,
        record: &FileRecord,
        out: &Path,
    ) -> ExtractOutcome {
        let target = target_path(out, record)
            .and_then(|target| check_ancestors(out, &target).map(|()| target));
        let result = match &target {
            Ok(target) => match record.file_type {
                FileType::Directory => self.create_directory(target),
                FileType::RegularFile => self.write_file(storage, record, target),
                FileType::Symlink => self.create_symlink(record, target),
            },
            Err(e) => Err(BackupError::UnsafePath(e.clone())),
        };

        ExtractOutcome {
            domain: record.domain.clone(),
            relative_path: record.relative_path.clone(),
            target: target.unwrap_or_default(),
            result,
        }
    }

    fn make_dirs(&self, dir: &Path) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(self.dir_mode).create(dir)
    }

    fn create_directory(&self, target: &Path) -> Result<ExtractAction> {
        if let Ok(meta) = fs::symlink_metadata(target) {
            if !meta.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", target.display()),
                )
                .into());
            }
        }
        self.make_dirs(target)?;
        Ok(ExtractAction::CreatedDirectory)
    }

    fn write_file(
        &self,
        storage: &Storage,
        record: &FileRecord,
        target: &Path,
    ) -> Result<ExtractAction> {
        if let Some(parent) = target.parent() {
            self.make_dirs(parent)?;
        }

        // Backups keep no data for empty files
        if record.size == 0 {
            return replace_with(target, |staging| {
                fs::File::create(staging)?;
                Ok(ExtractAction::CreatedEmpty)
            });
        }

        let source = storage.path_for(&record.file_id);
        match self.mode {
            LinkMode::Copy => replace_with(target, |staging| {
                let bytes = fs::copy(&source, staging)?;
                Ok(ExtractAction::Copied { bytes })
            }),
            LinkMode::Hardlink => {
                if same_inode(&source, target) {
                    return Ok(ExtractAction::AlreadyLinked);
                }
                replace_with(target, |staging| {
                    link_or_copy(&source, staging, |src, dst| fs::hard_link(src, dst))
                })
            }
        }
    }

    fn create_symlink(&self, record: &FileRecord, target: &Path) -> Result<ExtractAction> {
        let Some(link_target) = record.link_target.as_deref() else {
            debug!("Symlink {}-{} has no target", record.domain, record.relative_path);
            return Ok(ExtractAction::Skipped("symlink without target"));
        };
        if let Some(parent) = target.parent() {
            self.make_dirs(parent)?;
        }

        if let Ok(existing) = fs::read_link(target) {
            if existing == Path::new(link_target) {
                return Ok(ExtractAction::CreatedSymlink);
            }
        }
        clear_target(target)?;
        std::os::unix::fs::symlink(link_target, target)?;
        Ok(ExtractAction::CreatedSymlink)
    }
}

/// Extract a whole backup (no cancellation, default directory mode).
pub fn extract(backup: &Backup, out: &Path, mode: LinkMode) -> Result<ExtractSummary> {
    Extractor::new(mode).extract(backup, out)
}

/// Extract a filtered sequence of records from the backup at `root`.
pub fn extract_subset<I>(
    backup_type: BackupType,
    root: &Path,
    records: I,
    out: &Path,
    mode: LinkMode,
) -> Result<ExtractSummary>
where
    I: IntoIterator<Item = Result<FileRecord>>,
{
    Extractor::new(mode).extract_subset(&Storage::new(backup_type, root), records, out, |_| {})
}

/// `<out>/<domain>/<relative_path>`, refusing anything that would leave `out`.
fn target_path(out: &Path, record: &FileRecord) -> std::result::Result<PathBuf, String> {
    let domain = Path::new(&record.domain);
    let mut domain_parts = domain.components();
    match (domain_parts.next(), domain_parts.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return Err(format!("domain {:?}", record.domain)),
    }

    let mut target = out.join(domain);
    for component in Path::new(&record.relative_path).components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            _ => return Err(format!("{}-{}", record.domain, record.relative_path)),
        }
    }
    Ok(target)
}

/// Refuse a target whose path below `out` runs through a symlink, such as one
/// recreated from an earlier record.
fn check_ancestors(out: &Path, target: &Path) -> std::result::Result<(), String> {
    let inside = target
        .strip_prefix(out)
        .map_err(|_| format!("{} is outside {}", target.display(), out.display()))?;
    let mut ancestor = out.to_path_buf();
    let mut components = inside.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        ancestor.push(component);
        match fs::symlink_metadata(&ancestor) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(format!(
                    "{} passes through symlink {}",
                    target.display(),
                    ancestor.display()
                ));
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

/// Build the new entry next to `target` and rename it into place, so a
/// failure leaves whatever was at `target` untouched.
fn replace_with<F>(target: &Path, create: F) -> Result<ExtractAction>
where
    F: FnOnce(&Path) -> Result<ExtractAction>,
{
    let staging = staging_path(target);
    clear_target(&staging)?;
    if let Ok(meta) = fs::symlink_metadata(target) {
        if meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory", target.display()),
            )
            .into());
        }
    }

    let action = match create(&staging) {
        Ok(action) => action,
        Err(e) => {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
    };
    if let Err(e) = fs::rename(&staging, target) {
        let _ = fs::remove_file(&staging);
        return Err(e.into());
    }
    Ok(action)
}

fn staging_path(target: &Path) -> PathBuf {
    let name = target.file_name().unwrap_or_default().to_string_lossy();
    target.with_file_name(format!(".{}.extracting", name))
}

/// Hard-link `source` to `target`, copying instead when the filesystem
/// refuses links.
fn link_or_copy<L>(source: &Path, target: &Path, link: L) -> Result<ExtractAction>
where
    L: FnOnce(&Path, &Path) -> io::Result<()>,
{
    match link(source, target) {
        Ok(()) => Ok(ExtractAction::Linked),
        Err(e) => {
            let errno = Errno::from_raw(e.raw_os_error().unwrap_or(0));
            if !link_unsupported(errno) {
                return Err(e.into());
            }
            let refused = BackupError::UnsupportedLink {
                target: target.to_path_buf(),
                errno,
            };
            warn!("{}; copying instead", refused);
            let bytes = fs::copy(source, target)?;
            Ok(ExtractAction::CopiedAfterLinkFailure { bytes })
        }
    }
}

/// Remove a file or symlink at `target` if present; directories are left alone.
fn clear_target(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} is a directory", target.display()),
        )),
        Ok(_) => fs::remove_file(target),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn same_inode(a: &Path, b: &Path) -> bool {
    match (fs::metadata(a), fs::symlink_metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

/// Errors meaning the filesystem cannot hard-link here, as opposed to
/// a missing source or a permission problem on the path.
fn link_unsupported(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::EXDEV | Errno::EPERM | Errno::EMLINK | Errno::EOPNOTSUPP
    )
}
