//! Record source for `Manifest.db` backups.
//!
//! The `Files` table holds one row per entry: `fileID`, `domain`,
//! `relativePath`, `flags` and the archived metadata blob in `file`. Unlike
//! the legacy ledger, `fileID` here is read from the row and is authoritative.

use crate::manifest::keyed_archive::decode_file_blob;
use crate::manifest::{file_type_for, FileRecord, FileType};
use crate::utils::errors::{BackupError, Result};
use rusqlite::{params, Connection, OpenFlags, Row};
use std::collections::{HashSet, VecDeque};
use std::path::Path;

/// Columns the adapter reads from `Files`.
pub const REQUIRED_COLUMNS: [&str; 5] = ["fileID", "domain", "relativePath", "flags", "file"];

/// Rows fetched per query.
const PAGE_SIZE: i64 = 1000;

const PAGE_QUERY: &str = "SELECT fileID, domain, relativePath, flags, file FROM Files \
                          WHERE fileID > ?1 ORDER BY fileID LIMIT ?2";

/// Open the manifest database read-only and check its layout.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    check_schema(&conn).map_err(|e| match e {
        BackupError::Database(err) => BackupError::Format(format!(
            "{} is not a readable manifest database: {}",
            path.display(),
            err
        )),
        other => other,
    })?;
    Ok(conn)
}

/// Fail with a format error unless `Files` has every required column.
pub fn check_schema(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('Files')")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<String>>>()?;

    if columns.is_empty() {
        return Err(BackupError::Format("manifest database has no Files table".into()));
    }
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !columns.contains(*c))
        .collect();
    if !missing.is_empty() {
        return Err(BackupError::Format(format!(
            "Files table is missing columns: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Number of rows in `Files`.
pub fn count_files(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT count(*) FROM Files", [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// One undecoded row of `Files`
#[derive(Debug, Clone)]
struct FileRow {
    file_id: String,
    domain: String,
    relative_path: String,
    flags: i64,
    file: Vec<u8>,
}

fn row_to_file(row: &Row) -> rusqlite::Result<FileRow> {
    Ok(FileRow {
        file_id: row.get(0)?,
        domain: row.get(1)?,
        relative_path: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        flags: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
        file: row.get(4)?,
    })
}

/// Lazy record stream over `Files`.
///
/// Owns its connection and pages through the table ordered by `fileID`, so
/// each stream is independent of any other stream over the same database.
pub struct DatabaseRecords {
    conn: Connection,
    cursor: String,
    buffer: VecDeque<FileRow>,
    exhausted: bool,
    finished: bool,
}

impl DatabaseRecords {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            cursor: String::new(),
            buffer: VecDeque::new(),
            exhausted: false,
            finished: false,
        }
    }

    /// Open `path` and stream its records.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open(path)?))
    }

    fn fetch_page(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(PAGE_QUERY)?;
        let rows = stmt.query_map(params![self.cursor, PAGE_SIZE], row_to_file)?;
        for row in rows {
            self.buffer.push_back(row?);
        }

        if (self.buffer.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = self.buffer.back() {
            self.cursor = last.file_id.clone();
        }
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<FileRecord>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page()?;
        }
        match self.buffer.pop_front() {
            Some(row) => row_to_record(row).map(Some),
            None => Ok(None),
        }
    }
}

impl Iterator for DatabaseRecords {
    type Item = Result<FileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

fn row_to_record(row: FileRow) -> Result<FileRecord> {
    let archived = decode_file_blob(&row.file)?;

    if archived.relative_path != row.relative_path {
        return Err(BackupError::Format(format!(
            "relativePath mismatch for {}: row has {:?}, blob has {:?}",
            row.file_id, row.relative_path, archived.relative_path
        )));
    }

    let file_type = file_type_for(archived.mode, &row.domain, &row.relative_path);
    let expected_flags = match file_type {
        FileType::RegularFile => 1,
        FileType::Directory => 2,
        FileType::Symlink => 4,
    };
    if row.flags != expected_flags {
        tracing::warn!(
            "flags {} disagree with mode {:#o} for {}-{}",
            row.flags,
            archived.mode,
            row.domain,
            row.relative_path
        );
    }
    if archived.flags != 0 {
        tracing::debug!("Non-zero archived Flags {} for {}", archived.flags, row.file_id);
    }

    Ok(FileRecord {
        file_id: row.file_id,
        domain: row.domain,
        relative_path: row.relative_path,
        file_type,
        uid: archived.uid,
        gid: archived.gid,
        mode: archived.mode,
        inode: archived.inode,
        mtime: archived.mtime,
        ctime: archived.ctime,
        btime: archived.btime,
        size: match file_type {
            FileType::RegularFile => archived.size,
            _ => 0,
        },
        protection: archived.protection,
        extended_attributes: archived.extended_attributes,
        link_target: if file_type == FileType::Symlink {
            archived.link_target
        } else {
            None
        },
        digest: archived.digest,
    })
}
