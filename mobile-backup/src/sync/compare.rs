//! Content equality of two records from (possibly) different backups.

use crate::backup::storage::Storage;
use crate::manifest::{FileRecord, FileType};
use std::fs::File;
use std::io::{self, BufReader, Read};

/// Default chunk size for byte comparison (64KB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Whether two records with the same key hold the same content.
///
/// Types are compared first. Directories carry no content; symlinks compare
/// their targets. Regular files compare digests when both sides have one,
/// otherwise sizes and then the stored bytes, stopping at the first
/// difference.
pub fn same_content(
    a: &FileRecord,
    a_storage: &Storage,
    b: &FileRecord,
    b_storage: &Storage,
    buffer_size: usize,
) -> io::Result<bool> {
    if a.file_type != b.file_type {
        return Ok(false);
    }
    match a.file_type {
        FileType::Directory => Ok(true),
        FileType::Symlink => Ok(a.link_target == b.link_target),
        FileType::RegularFile => {
            if let (Some(da), Some(db)) = (a.usable_digest(), b.usable_digest()) {
                return Ok(da.eq_ignore_ascii_case(db));
            }
            if a.size != b.size {
                return Ok(false);
            }
            if a.size == 0 {
                return Ok(true);
            }
            let left = File::open(a_storage.path_for(&a.file_id))?;
            let right = File::open(b_storage.path_for(&b.file_id))?;
            if left.metadata()?.len() != right.metadata()?.len() {
                return Ok(false);
            }
            same_bytes(left, right, buffer_size)
        }
    }
}

/// Compare two streams chunk by chunk.
pub fn same_bytes<A: Read, B: Read>(a: A, b: B, buffer_size: usize) -> io::Result<bool> {
    let buffer_size = buffer_size.max(1);
    let mut a = BufReader::with_capacity(buffer_size, a);
    let mut b = BufReader::with_capacity(buffer_size, b);
    let mut buf_a = vec![0u8; buffer_size];
    let mut buf_b = vec![0u8; buffer_size];

    loop {
        let n = read_full(&mut a, &mut buf_a)?;
        let m = read_full(&mut b, &mut buf_b)?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Ok(false);
        }
        if n == 0 {
            return Ok(true);
        }
    }
}

/// Fill `buf` as far as the stream allows; returns bytes read (0 at EOF).
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
