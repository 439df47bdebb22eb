//! Decoder for the legacy `Manifest.mbdb` ledger.
//!
//! ## Layout (all integers big-endian)
//!
//! ```text
//! [Magic: "mbdb"] [Version: u16 = 0x0500]
//! For each record:
//!   [Domain: string]
//!   [RelativePath: string]
//!   [LinkTarget: string]
//!   [Digest: string]
//!   [Reserved: string]
//!   [Mode: u16] [Inode: u64] [Uid: u32] [Gid: u32]
//!   [Time1: u32] [Time2: u32] [Time3: u32]
//!   [Size: u64] [Protection: u8] [PropertyCount: u8]
//!   PropertyCount x ([Name: string] [Value: string])
//!
//! string := [Length: u16] [Bytes; Length]   (Length 0xFFFF = absent)
//! ```
//!
//! The ledger has no fileID column; it is derived from domain and path.

use crate::manifest::timestamps::legacy_timestamps;
use crate::manifest::{file_id, file_type_for, ExtendedAttributes, FileRecord, FileType};
use crate::utils::errors::{BackupError, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

pub const MBDB_MAGIC: &[u8; 4] = b"mbdb";
pub const MBDB_VERSION: u16 = 0x0500;
pub const HEADER_LEN: u64 = 6;

/// Length prefix marking an absent string.
pub const ABSENT: u16 = 0xFFFF;

/// Streaming reader over the records of a `Manifest.mbdb` file.
///
/// Single pass: once exhausted (or after an error) it yields nothing more.
pub struct MbdbReader<R> {
    reader: R,
    offset: u64,
    record_start: u64,
    finished: bool,
}

/// Open a ledger file and validate its header.
pub fn open(path: &Path) -> Result<MbdbReader<BufReader<File>>> {
    let file = File::open(path)?;
    MbdbReader::new(BufReader::new(file))
}

impl<R: BufRead> MbdbReader<R> {
    /// Consume and check the 6-byte header.
    pub fn new(mut reader: R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN as usize];
        reader.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                BackupError::Format("manifest is shorter than the mbdb header".into())
            }
            _ => BackupError::Io(e),
        })?;

        if &header[0..4] != MBDB_MAGIC {
            return Err(BackupError::Format("missing mbdb magic".into()));
        }
        let version = u16::from_be_bytes([header[4], header[5]]);
        if version != MBDB_VERSION {
            return Err(BackupError::Format(format!(
                "unsupported mbdb version {:#06x}",
                version
            )));
        }

        Ok(Self {
            reader,
            offset: HEADER_LEN,
            record_start: HEADER_LEN,
            finished: false,
        })
    }

    /// Byte offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn next_record(&mut self) -> Result<Option<FileRecord>> {
        // Clean end of stream is only legal between records
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }
        self.record_start = self.offset;

        let domain = self.read_text("domain")?;
        let relative_path = self.read_text("relative path")?;
        let link_target = self.read_field("link target")?.map(into_text);
        let digest = self.read_field("digest")?.map(hex::encode);
        if let Some(reserved) = self.read_field("reserved")? {
            if !reserved.is_empty() {
                tracing::debug!(
                    "Non-empty reserved field ({} bytes) at offset {}",
                    reserved.len(),
                    self.record_start
                );
            }
        }

        let mode = u32::from(self.read_u16("mode")?);
        let inode = self.read_u64("inode")?;
        let uid = self.read_u32("uid")?;
        let gid = self.read_u32("gid")?;
        let raw_times = [
            i64::from(self.read_u32("timestamp")?),
            i64::from(self.read_u32("timestamp")?),
            i64::from(self.read_u32("timestamp")?),
        ];
        let size = self.read_u64("size")?;
        let protection = u32::from(self.read_u8("protection")?);
        let property_count = self.read_u8("property count")?;

        let mut attributes = ExtendedAttributes::new();
        for _ in 0..property_count {
            let name = self.read_text("property name")?;
            let value = self.read_field("property value")?.unwrap_or_default();
            attributes.insert(name, value);
        }

        let file_type = file_type_for(mode, &domain, &relative_path);
        let times = legacy_timestamps(raw_times);

        Ok(Some(FileRecord {
            file_id: file_id(&domain, &relative_path),
            domain,
            relative_path,
            file_type,
            uid,
            gid,
            mode,
            inode,
            mtime: times.mtime,
            ctime: times.ctime,
            btime: times.btime,
            size: match file_type {
                FileType::RegularFile => size,
                _ => 0,
            },
            protection,
            extended_attributes: (property_count > 0).then_some(attributes),
            link_target: link_target.filter(|_| file_type == FileType::Symlink),
            digest,
        }))
    }

    /// Length-prefixed field; `None` when the length is the absent marker.
    fn read_field(&mut self, what: &str) -> Result<Option<Vec<u8>>> {
        let len = self.read_u16(what)?;
        if len == ABSENT {
            return Ok(None);
        }
        let mut buf = vec![0u8; usize::from(len)];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| self.short_read(e, what))?;
        self.offset += u64::from(len);
        Ok(Some(buf))
    }

    /// Text field where absent and empty mean the same thing.
    fn read_text(&mut self, what: &str) -> Result<String> {
        Ok(self.read_field(what)?.map(into_text).unwrap_or_default())
    }

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        let v = self.reader.read_u8().map_err(|e| self.short_read(e, what))?;
        self.offset += 1;
        Ok(v)
    }

    fn read_u16(&mut self, what: &str) -> Result<u16> {
        let v = self
            .reader
            .read_u16::<BigEndian>()
            .map_err(|e| self.short_read(e, what))?;
        self.offset += 2;
        Ok(v)
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        let v = self
            .reader
            .read_u32::<BigEndian>()
            .map_err(|e| self.short_read(e, what))?;
        self.offset += 4;
        Ok(v)
    }

    fn read_u64(&mut self, what: &str) -> Result<u64> {
        let v = self
            .reader
            .read_u64::<BigEndian>()
            .map_err(|e| self.short_read(e, what))?;
        self.offset += 8;
        Ok(v)
    }

    fn short_read(&self, err: io::Error, what: &str) -> BackupError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            BackupError::TruncatedRecord {
                offset: self.record_start,
                detail: format!("stream ended while reading {}", what),
            }
        } else {
            BackupError::Io(err)
        }
    }
}

impl<R: BufRead> Iterator for MbdbReader<R> {
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

/// UTF-8 text, or lowercase hex when the bytes are not valid UTF-8.
fn into_text(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_else(|e| hex::encode(e.into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mbdb_header, MbdbEntry};
    use std::io::Cursor;

    fn decode(bytes: Vec<u8>) -> Result<Vec<FileRecord>> {
        MbdbReader::new(Cursor::new(bytes))?.collect()
    }

    #[test]
    fn test_single_directory_record() {
        let mut bytes = mbdb_header();
        MbdbEntry::directory("HomeDomain", "").write_to(&mut bytes);

        let records = decode(bytes).unwrap();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.domain, "HomeDomain");
        assert_eq!(record.relative_path, "");
        assert_eq!(record.file_type, FileType::Directory);
        assert_eq!(record.mode, 0o40755);
        assert_eq!(record.permissions(), 0o755);
        assert_eq!(record.size, 0);
        assert_eq!(record.file_id, "70765829101933f25994c71bbee6dfd685535bff");
        assert_eq!(record.link_target, None);
        assert_eq!(record.digest, None);
        assert_eq!(record.extended_attributes, None);
    }

    #[test]
    fn test_header_only_is_empty() {
        assert!(decode(mbdb_header()).unwrap().is_empty());
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut bad_magic = b"mbdx".to_vec();
        bad_magic.extend_from_slice(&[5, 0]);
        assert!(matches!(decode(bad_magic), Err(BackupError::Format(_))));

        let mut bad_version = b"mbdb".to_vec();
        bad_version.extend_from_slice(&[4, 0]);
        assert!(matches!(decode(bad_version), Err(BackupError::Format(_))));

        assert!(matches!(decode(b"mb".to_vec()), Err(BackupError::Format(_))));
    }

    #[test]
    fn test_fields_and_timestamp_order() {
        let mut entry = MbdbEntry::file("HomeDomain", "Library/a.txt", 10);
        entry.digest = Some(vec![0xaa; 20]);
        entry.times = [1_400_000_000, 1_400_000_100, 1_300_000_000];
        entry.protection = 4;
        entry.uid = 501;
        entry.gid = 501;
        entry.inode = 77;
        entry.properties = vec![("com.apple.foo".into(), b"bar".to_vec())];

        let mut bytes = mbdb_header();
        entry.write_to(&mut bytes);
        let record = decode(bytes).unwrap().remove(0);

        assert_eq!(record.file_type, FileType::RegularFile);
        assert_eq!(record.size, 10);
        assert_eq!(record.digest.as_deref(), Some("aa".repeat(20).as_str()));
        assert_eq!(record.mtime.timestamp(), 1_400_000_000);
        assert_eq!(record.ctime.timestamp(), 1_400_000_100);
        assert_eq!(record.btime.timestamp(), 1_300_000_000);
        assert_eq!(record.protection, 4);
        assert_eq!((record.uid, record.gid, record.inode), (501, 501, 77));
        let attrs = record.extended_attributes.unwrap();
        assert_eq!(attrs.get("com.apple.foo").map(Vec::as_slice), Some(&b"bar"[..]));
    }

    #[test]
    fn test_absent_and_empty_link_target_differ() {
        let absent = MbdbEntry::symlink("HomeDomain", "link", None);
        let empty = MbdbEntry::symlink("HomeDomain", "link2", Some(""));

        let mut bytes = mbdb_header();
        absent.write_to(&mut bytes);
        empty.write_to(&mut bytes);
        let records = decode(bytes).unwrap();

        assert_eq!(records[0].link_target, None);
        assert_eq!(records[1].link_target.as_deref(), Some(""));
        assert_eq!(records[1].file_type, FileType::Symlink);
    }

    #[test]
    fn test_truncated_record_keeps_earlier_records() {
        let mut bytes = mbdb_header();
        MbdbEntry::directory("HomeDomain", "").write_to(&mut bytes);
        let first_end = bytes.len() as u64;
        MbdbEntry::file("HomeDomain", "Library/a.txt", 3).write_to(&mut bytes);
        bytes.truncate(bytes.len() - 5);

        let mut reader = MbdbReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.next().unwrap().is_ok());
        match reader.next() {
            Some(Err(BackupError::TruncatedRecord { offset, .. })) => assert_eq!(offset, first_end),
            other => panic!("expected truncated record, got {:?}", other),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_length_prefix_past_end_is_truncation() {
        let mut bytes = mbdb_header();
        bytes.extend_from_slice(&[0x00, 0x20]);
        bytes.extend_from_slice(b"short");

        assert!(matches!(
            decode(bytes),
            Err(BackupError::TruncatedRecord { offset: HEADER_LEN, .. })
        ));
    }

    #[test]
    fn test_single_trailing_byte_is_truncation() {
        let mut bytes = mbdb_header();
        bytes.push(0x00);
        assert!(matches!(decode(bytes), Err(BackupError::TruncatedRecord { .. })));
    }

    #[test]
    fn test_unknown_type_bits_decode_as_regular_file() {
        let mut entry = MbdbEntry::file("HomeDomain", "dev/odd", 0);
        entry.mode = 0o020644;

        let mut bytes = mbdb_header();
        entry.write_to(&mut bytes);
        let record = decode(bytes).unwrap().remove(0);
        assert_eq!(record.file_type, FileType::RegularFile);
        assert_eq!(record.mode, 0o020644);
    }

    #[test]
    fn test_invalid_utf8_path_is_hex() {
        let mut entry = MbdbEntry::file("HomeDomain", "", 0);
        entry.raw_path = Some(vec![0xff, 0xfe]);

        let mut bytes = mbdb_header();
        entry.write_to(&mut bytes);
        let record = decode(bytes).unwrap().remove(0);
        assert_eq!(record.relative_path, "fffe");
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let mut bytes = mbdb_header();
        MbdbEntry::directory("HomeDomain", "").write_to(&mut bytes);
        MbdbEntry::file("HomeDomain", "Library/a.txt", 3).write_to(&mut bytes);
        MbdbEntry::symlink("MediaDomain", "link", Some("/var/mobile")).write_to(&mut bytes);

        assert_eq!(decode(bytes.clone()).unwrap(), decode(bytes).unwrap());
    }
}
