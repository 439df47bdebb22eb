//! Decoding of the per-file metadata blob in `Manifest.db`.
//!
//! The `file` column holds a binary property list produced by a keyed
//! archiver. Its `$objects` array starts with `"$null"`, the root object sits
//! at the index named by `$top.root`, and several root keys (`RelativePath`,
//! `Target`, `Digest`, `ExtendedAttributes`, `$class`) are UIDs pointing to
//! other entries of `$objects`.

use crate::manifest::timestamps::{utc_from_fractional, utc_from_secs};
use crate::manifest::ExtendedAttributes;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use plist::{Dictionary, Value};
use std::io::Cursor;

const ARCHIVER: &str = "NSKeyedArchiver";
const FILE_CLASS: &str = "MBFile";

/// Fields carried by one archived file object
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedFile {
    pub relative_path: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub inode: u64,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub btime: DateTime<Utc>,
    pub size: u64,
    pub protection: u32,
    pub flags: u64,
    pub extended_attributes: Option<ExtendedAttributes>,
    pub link_target: Option<String>,
    pub digest: Option<String>,
}

/// Decode an archived `MBFile` blob.
pub fn decode_file_blob(blob: &[u8]) -> Result<ArchivedFile> {
    let archive = Value::from_reader(Cursor::new(blob))
        .map_err(|e| BackupError::Format(format!("file blob is not a property list: {}", e)))?;
    let archive = archive
        .as_dictionary()
        .ok_or_else(|| malformed("top level is not a dictionary"))?;

    if archive.get("$archiver").and_then(Value::as_string) != Some(ARCHIVER) {
        return Err(malformed("$archiver is not NSKeyedArchiver"));
    }
    let objects = archive
        .get("$objects")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing $objects"))?;
    if objects.first().and_then(Value::as_string) != Some("$null") {
        return Err(malformed("$objects[0] is not $null"));
    }
    let root_ref = archive
        .get("$top")
        .and_then(Value::as_dictionary)
        .and_then(|top| top.get("root"))
        .ok_or_else(|| malformed("missing $top.root"))?;
    let root = resolve(objects, root_ref)?
        .as_dictionary()
        .ok_or_else(|| malformed("root object is not a dictionary"))?;

    let class_name = root
        .get("$class")
        .map(|class| resolve(objects, class))
        .transpose()?
        .and_then(Value::as_dictionary)
        .and_then(|class| class.get("$classname"))
        .and_then(Value::as_string);
    if class_name != Some(FILE_CLASS) {
        return Err(malformed("root object is not an MBFile"));
    }

    let relative_path = match root.get("RelativePath") {
        Some(v) => resolve(objects, v)?
            .as_string()
            .ok_or_else(|| malformed("RelativePath is not a string"))?
            .to_string(),
        None => return Err(malformed("missing RelativePath")),
    };

    let link_target = root
        .get("Target")
        .map(|v| resolve(objects, v))
        .transpose()?
        .and_then(Value::as_string)
        .map(str::to_string);

    let digest = root
        .get("Digest")
        .map(|v| resolve(objects, v))
        .transpose()?
        .and_then(ns_data)
        .map(hex::encode);

    let extended_attributes = root
        .get("ExtendedAttributes")
        .map(|v| resolve(objects, v))
        .transpose()?
        .map(decode_attributes)
        .transpose()?;

    Ok(ArchivedFile {
        relative_path,
        uid: unsigned(root, "UserID") as u32,
        gid: unsigned(root, "GroupID") as u32,
        mode: unsigned(root, "Mode") as u32,
        inode: unsigned(root, "InodeNumber"),
        mtime: instant(root, "LastModified"),
        ctime: instant(root, "LastStatusChange"),
        btime: instant(root, "Birth"),
        size: unsigned(root, "Size"),
        protection: unsigned(root, "ProtectionClass") as u32,
        flags: unsigned(root, "Flags"),
        extended_attributes,
        link_target,
        digest,
    })
}

/// Follow a UID reference into `$objects`; inline values resolve to themselves.
fn resolve<'a>(objects: &'a [Value], value: &'a Value) -> Result<&'a Value> {
    match value {
        Value::Uid(uid) => objects
            .get(uid.get() as usize)
            .ok_or_else(|| malformed("UID points past $objects")),
        other => Ok(other),
    }
}

/// Raw bytes, either directly or wrapped as `{ "NS.data": <data> }`.
fn ns_data(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Data(bytes) => Some(bytes.as_slice()),
        Value::Dictionary(dict) => dict.get("NS.data").and_then(Value::as_data),
        _ => None,
    }
}

fn decode_attributes(value: &Value) -> Result<ExtendedAttributes> {
    let bytes = ns_data(value).ok_or_else(|| malformed("ExtendedAttributes is not data"))?;
    let parsed = Value::from_reader(Cursor::new(bytes))
        .map_err(|e| BackupError::Format(format!("extended attributes: {}", e)))?;
    let dict = parsed
        .as_dictionary()
        .ok_or_else(|| malformed("extended attributes are not a dictionary"))?;

    let mut attributes = ExtendedAttributes::new();
    for (name, value) in dict {
        match value {
            Value::Data(bytes) => {
                attributes.insert(name.clone(), bytes.clone());
            }
            Value::String(text) => {
                attributes.insert(name.clone(), text.clone().into_bytes());
            }
            other => tracing::debug!("Skipping extended attribute {} of type {:?}", name, other),
        }
    }
    Ok(attributes)
}

fn unsigned(dict: &Dictionary, key: &str) -> u64 {
    dict.get(key)
        .and_then(|v| {
            v.as_unsigned_integer()
                .or_else(|| v.as_signed_integer().map(|i| i.max(0) as u64))
        })
        .unwrap_or(0)
}

/// Timestamps here are already in semantic order; they may be integral or real.
fn instant(dict: &Dictionary, key: &str) -> DateTime<Utc> {
    match dict.get(key) {
        Some(Value::Real(secs)) => utc_from_fractional(*secs),
        Some(v) => v
            .as_signed_integer()
            .map(utc_from_secs)
            .unwrap_or_default(),
        None => DateTime::default(),
    }
}

fn malformed(detail: &str) -> BackupError {
    BackupError::Format(format!("file blob: {}", detail))
}
