//! Read-only views of a backup: record listings, type counts and the
//! descriptive metadata.

use crate::backup::Backup;
use crate::manifest::{FileRecord, FileType};
use crate::utils::errors::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::io::{self, Write};

/// Listing columns, in output order. Extended attributes are left out.
pub const LISTING_COLUMNS: [&str; 16] = [
    "fileID",
    "domain",
    "relativePath",
    "uid",
    "gid",
    "mtime",
    "ctime",
    "btime",
    "inode",
    "mode",
    "fileType",
    "permissions",
    "size",
    "protection",
    "linkTarget",
    "digest",
];

#[derive(Debug, Clone)]
pub struct ListingOptions {
    pub separator: String,
    pub header: bool,
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            separator: "\t".to_string(),
            header: true,
        }
    }
}

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn listing_row(record: &FileRecord) -> [String; 16] {
    [
        record.file_id.clone(),
        record.domain.clone(),
        record.relative_path.clone(),
        record.uid.to_string(),
        record.gid.to_string(),
        timestamp(&record.mtime),
        timestamp(&record.ctime),
        timestamp(&record.btime),
        record.inode.to_string(),
        record.mode.to_string(),
        record.file_type.to_string(),
        format!("{:o}", record.permissions()),
        record.size.to_string(),
        record.protection.to_string(),
        record.link_target.clone().unwrap_or_default(),
        record.digest.clone().unwrap_or_default(),
    ]
}

/// Write one separated line per record; returns the number of records.
pub fn write_listing<W, I>(out: &mut W, records: I, options: &ListingOptions) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = Result<FileRecord>>,
{
    if options.header {
        writeln!(out, "{}", LISTING_COLUMNS.join(&options.separator))?;
    }
    let mut count = 0;
    for record in records {
        let record = record?;
        writeln!(out, "{}", listing_row(&record).join(&options.separator))?;
        count += 1;
    }
    Ok(count)
}

/// Write one JSON object per line per record.
pub fn write_json_listing<W, I>(out: &mut W, records: I) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = Result<FileRecord>>,
{
    let mut count = 0;
    for record in records {
        serde_json::to_writer(&mut *out, &record?).map_err(io::Error::from)?;
        out.write_all(b"\n")?;
        count += 1;
    }
    Ok(count)
}

/// Record counts of a backup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    /// Sum of regular-file sizes
    pub total_bytes: u64,
}

impl BackupSummary {
    pub fn records(&self) -> usize {
        self.files + self.directories + self.symlinks
    }
}

pub fn summarize<I>(records: I) -> Result<BackupSummary>
where
    I: IntoIterator<Item = Result<FileRecord>>,
{
    let mut summary = BackupSummary::default();
    for record in records {
        let record = record?;
        match record.file_type {
            FileType::RegularFile => {
                summary.files += 1;
                summary.total_bytes += record.size;
            }
            FileType::Directory => summary.directories += 1,
            FileType::Symlink => summary.symlinks += 1,
        }
    }
    Ok(summary)
}

/// `YYYYMMDDTHHMMSS`, used to name snapshots after their backup date.
pub fn compact_date(date: &DateTime<Utc>) -> String {
    date.format("%Y%m%dT%H%M%S").to_string()
}

fn field<W: Write>(out: &mut W, name: &str, value: impl Display) -> io::Result<()> {
    writeln!(out, "{:25} {}", name, value)
}

fn optional<T: Display>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

fn optional_date(value: &Option<DateTime<Utc>>) -> String {
    value.as_ref().map(timestamp).unwrap_or_default()
}

/// Human-readable summary: both descriptive plists and the record counts.
pub fn write_summary<W: Write>(
    out: &mut W,
    backup: &Backup,
    summary: &BackupSummary,
) -> io::Result<()> {
    let manifest = backup.manifest();
    let device = &manifest.device;
    writeln!(out, "Manifest.plist")?;
    writeln!(out, "==============")?;
    field(out, "#Applications", manifest.applications.len())?;
    field(out, "BuildVersion", optional(&device.build_version))?;
    field(out, "Date", optional_date(&manifest.date))?;
    field(out, "DeviceName", optional(&device.device_name))?;
    field(out, "IsEncrypted", manifest.is_encrypted)?;
    field(out, "ProductType", optional(&device.product_type))?;
    field(out, "ProductVersion", optional(&device.product_version))?;
    field(out, "SerialNumber", optional(&device.serial_number))?;
    field(out, "UniqueDeviceID", optional(&device.unique_device_id))?;
    field(out, "Version", optional(&manifest.version))?;
    writeln!(out)?;

    let status = backup.status();
    writeln!(out, "Status.plist")?;
    writeln!(out, "============")?;
    field(out, "BackupState", optional(&status.backup_state))?;
    field(out, "Date", optional_date(&status.date))?;
    field(out, "IsFullBackup", status.is_full_backup)?;
    field(out, "SnapshotState", optional(&status.snapshot_state))?;
    field(out, "UUID", optional(&status.uuid))?;
    field(out, "Version", optional(&status.version))?;
    writeln!(out)?;

    writeln!(out, "Records")?;
    writeln!(out, "=======")?;
    field(out, "BackupType", backup.backup_type())?;
    field(out, "RegularFiles", summary.files)?;
    field(out, "Directories", summary.directories)?;
    field(out, "Symlinks", summary.symlinks)?;
    field(out, "TotalBytes", summary.total_bytes)?;
    Ok(())
}
