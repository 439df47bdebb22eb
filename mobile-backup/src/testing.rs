//! Fixture builders for unit tests: legacy ledgers, manifest databases,
//! descriptive plists and whole backup directories.

use crate::backup::metadata::{MANIFEST_PLIST, STATUS_PLIST};
use crate::backup::storage::storage_path_for;
use crate::backup::{BackupType, MANIFEST_DB, MANIFEST_MBDB};
use crate::manifest::file_id;
use crate::manifest::mbdb::{ABSENT, MBDB_MAGIC, MBDB_VERSION};
use byteorder::{BigEndian, WriteBytesExt};
use plist::{Dictionary, Uid, Value};
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

pub fn mbdb_header() -> Vec<u8> {
    let mut bytes = MBDB_MAGIC.to_vec();
    bytes.write_u16::<BigEndian>(MBDB_VERSION).unwrap();
    bytes
}

fn write_field(out: &mut Vec<u8>, field: Option<&[u8]>) {
    match field {
        Some(bytes) => {
            out.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
            out.extend_from_slice(bytes);
        }
        None => out.write_u16::<BigEndian>(ABSENT).unwrap(),
    }
}

/// One record of a legacy ledger
#[derive(Debug, Clone)]
pub struct MbdbEntry {
    pub domain: String,
    pub path: String,
    pub raw_path: Option<Vec<u8>>,
    pub link_target: Option<String>,
    pub digest: Option<Vec<u8>>,
    pub mode: u16,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub times: [u32; 3],
    pub size: u64,
    pub protection: u8,
    pub properties: Vec<(String, Vec<u8>)>,
}

impl MbdbEntry {
    fn new(domain: &str, path: &str, mode: u16, size: u64) -> Self {
        Self {
            domain: domain.into(),
            path: path.into(),
            raw_path: None,
            link_target: None,
            digest: None,
            mode,
            inode: 1,
            uid: 501,
            gid: 501,
            times: [1_300_000_000, 1_300_000_100, 1_200_000_000],
            size,
            protection: 0,
            properties: Vec::new(),
        }
    }

    pub fn directory(domain: &str, path: &str) -> Self {
        Self::new(domain, path, 0o40755, 0)
    }

    pub fn file(domain: &str, path: &str, size: u64) -> Self {
        Self::new(domain, path, 0o100644, size)
    }

    pub fn symlink(domain: &str, path: &str, target: Option<&str>) -> Self {
        let mut entry = Self::new(domain, path, 0o120755, 0);
        entry.link_target = target.map(str::to_string);
        entry
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        write_field(out, Some(self.domain.as_bytes()));
        let path = self.raw_path.clone().unwrap_or_else(|| self.path.as_bytes().to_vec());
        write_field(out, Some(&path));
        write_field(out, self.link_target.as_deref().map(str::as_bytes));
        write_field(out, self.digest.as_deref());
        write_field(out, None);
        out.write_u16::<BigEndian>(self.mode).unwrap();
        out.write_u64::<BigEndian>(self.inode).unwrap();
        out.write_u32::<BigEndian>(self.uid).unwrap();
        out.write_u32::<BigEndian>(self.gid).unwrap();
        for t in self.times {
            out.write_u32::<BigEndian>(t).unwrap();
        }
        out.write_u64::<BigEndian>(self.size).unwrap();
        out.write_u8(self.protection).unwrap();
        out.write_u8(self.properties.len() as u8).unwrap();
        for (name, value) in &self.properties {
            write_field(out, Some(name.as_bytes()));
            write_field(out, Some(value));
        }
    }
}

/// Archived `MBFile` object as stored in the `file` column
#[derive(Debug, Clone)]
pub struct ArchivedEntry {
    pub relative_path: String,
    pub mode: u32,
    pub size: u64,
    pub times: [i64; 3],
    pub protection: u64,
    pub digest: Option<Vec<u8>>,
    pub wrap_data: bool,
    pub attributes: Vec<(String, Vec<u8>)>,
    pub link_target: Option<String>,
    pub class_name: String,
    pub archiver: String,
}

impl ArchivedEntry {
    fn new(relative_path: &str, mode: u32, size: u64) -> Self {
        Self {
            relative_path: relative_path.into(),
            mode,
            size,
            times: [1_500_000_000, 1_500_000_100, 1_400_000_000],
            protection: 0,
            digest: None,
            wrap_data: false,
            attributes: Vec::new(),
            link_target: None,
            class_name: "MBFile".into(),
            archiver: "NSKeyedArchiver".into(),
        }
    }

    pub fn directory(relative_path: &str) -> Self {
        Self::new(relative_path, 0o40755, 0)
    }

    pub fn file(relative_path: &str, size: u64) -> Self {
        Self::new(relative_path, 0o100644, size)
    }

    pub fn symlink(relative_path: &str, target: &str) -> Self {
        let mut entry = Self::new(relative_path, 0o120755, 0);
        entry.link_target = Some(target.into());
        entry
    }

    fn data(&self, bytes: Vec<u8>) -> Value {
        if self.wrap_data {
            let mut dict = Dictionary::new();
            dict.insert("NS.data".into(), Value::Data(bytes));
            Value::Dictionary(dict)
        } else {
            Value::Data(bytes)
        }
    }

    pub fn to_blob(&self) -> Vec<u8> {
        let int = |v: i64| Value::Integer(v.into());
        let mut objects = vec![Value::String("$null".into())];

        let mut root = Dictionary::new();
        root.insert("UserID".into(), int(501));
        root.insert("GroupID".into(), int(501));
        root.insert("InodeNumber".into(), int(1234));
        root.insert("Mode".into(), int(i64::from(self.mode)));
        root.insert("Size".into(), int(self.size as i64));
        root.insert("LastModified".into(), int(self.times[0]));
        root.insert("LastStatusChange".into(), int(self.times[1]));
        root.insert("Birth".into(), int(self.times[2]));
        root.insert("ProtectionClass".into(), int(self.protection as i64));
        root.insert("Flags".into(), int(0));
        root.insert("RelativePath".into(), Value::Uid(Uid::new(2)));
        root.insert("$class".into(), Value::Uid(Uid::new(3)));
        objects.push(Value::Dictionary(Dictionary::new()));
        objects.push(Value::String(self.relative_path.clone()));

        let mut class = Dictionary::new();
        class.insert("$classname".into(), Value::String(self.class_name.clone()));
        class.insert(
            "$classes".into(),
            Value::Array(vec![
                Value::String(self.class_name.clone()),
                Value::String("NSObject".into()),
            ]),
        );
        objects.push(Value::Dictionary(class));

        if let Some(target) = &self.link_target {
            root.insert("Target".into(), Value::Uid(Uid::new(objects.len() as u64)));
            objects.push(Value::String(target.clone()));
        }
        if let Some(digest) = &self.digest {
            root.insert("Digest".into(), Value::Uid(Uid::new(objects.len() as u64)));
            objects.push(self.data(digest.clone()));
        }
        if !self.attributes.is_empty() {
            let mut attrs = Dictionary::new();
            for (name, value) in &self.attributes {
                attrs.insert(name.clone(), Value::Data(value.clone()));
            }
            let mut encoded = Vec::new();
            Value::Dictionary(attrs).to_writer_binary(&mut encoded).unwrap();
            root.insert("ExtendedAttributes".into(), Value::Uid(Uid::new(objects.len() as u64)));
            objects.push(self.data(encoded));
        }
        objects[1] = Value::Dictionary(root);

        let mut top = Dictionary::new();
        top.insert("root".into(), Value::Uid(Uid::new(1)));

        let mut archive = Dictionary::new();
        archive.insert("$version".into(), int(100_000));
        archive.insert("$archiver".into(), Value::String(self.archiver.clone()));
        archive.insert("$top".into(), Value::Dictionary(top));
        archive.insert("$objects".into(), Value::Array(objects));

        let mut blob = Vec::new();
        Value::Dictionary(archive).to_writer_binary(&mut blob).unwrap();
        blob
    }
}

/// One row of the `Files` table
#[derive(Debug, Clone)]
pub struct DbEntry {
    pub domain: String,
    pub file_id: Option<String>,
    pub relative_path: Option<String>,
    pub flags: Option<i64>,
    pub archived: ArchivedEntry,
}

impl DbEntry {
    pub fn new(domain: &str, archived: ArchivedEntry) -> Self {
        Self {
            domain: domain.into(),
            file_id: None,
            relative_path: None,
            flags: None,
            archived,
        }
    }
}

pub fn write_manifest_db(path: &Path, entries: &[DbEntry]) {
    let mut conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Files (fileID TEXT PRIMARY KEY, domain TEXT, relativePath TEXT, flags INTEGER, file BLOB);
         CREATE TABLE Properties (key TEXT PRIMARY KEY, value BLOB);",
    )
    .unwrap();

    let tx = conn.transaction().unwrap();
    for entry in entries {
        let relative_path = entry
            .relative_path
            .clone()
            .unwrap_or_else(|| entry.archived.relative_path.clone());
        let id = entry
            .file_id
            .clone()
            .unwrap_or_else(|| file_id(&entry.domain, &relative_path));
        let flags = entry.flags.unwrap_or(match entry.archived.mode & 0o170000 {
            0o040000 => 2,
            0o120000 => 4,
            _ => 1,
        });
        tx.execute(
            "INSERT INTO Files (fileID, domain, relativePath, flags, file) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, entry.domain, relative_path, flags, entry.archived.to_blob()],
        )
        .unwrap();
    }
    tx.commit().unwrap();
}

fn date(secs: u64) -> Value {
    Value::Date(plist::Date::from(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)))
}

pub fn write_manifest_plist(path: &Path, version: &str, udid: &str) {
    let mut lockdown = Dictionary::new();
    lockdown.insert("UniqueDeviceID".into(), Value::String(udid.into()));
    lockdown.insert("DeviceName".into(), Value::String("Test Phone".into()));
    lockdown.insert("ProductType".into(), Value::String("iPhone9,3".into()));
    lockdown.insert("ProductVersion".into(), Value::String("10.3.1".into()));
    lockdown.insert("BuildVersion".into(), Value::String("14E304".into()));
    lockdown.insert("SerialNumber".into(), Value::String("SERIAL".into()));

    let mut app = Dictionary::new();
    app.insert("CFBundleIdentifier".into(), Value::String("com.example.app".into()));
    let mut applications = Dictionary::new();
    applications.insert("com.example.app".into(), Value::Dictionary(app));

    let mut manifest = Dictionary::new();
    manifest.insert("Version".into(), Value::String(version.into()));
    manifest.insert("IsEncrypted".into(), Value::Boolean(false));
    manifest.insert("Date".into(), date(1_500_000_000));
    manifest.insert("Lockdown".into(), Value::Dictionary(lockdown));
    manifest.insert("Applications".into(), Value::Dictionary(applications));
    Value::Dictionary(manifest).to_file_xml(path).unwrap();
}

pub fn write_status_plist(path: &Path, date_secs: u64) {
    let mut status = Dictionary::new();
    status.insert("Version".into(), Value::String("3.2".into()));
    status.insert("IsFullBackup".into(), Value::Boolean(true));
    status.insert("BackupState".into(), Value::String("new".into()));
    status.insert("SnapshotState".into(), Value::String("finished".into()));
    status.insert("UUID".into(), Value::String("0000-1111".into()));
    status.insert("Date".into(), date(date_secs));
    Value::Dictionary(status).to_file_xml(path).unwrap();
}

/// Write both descriptive plists into a backup root.
pub fn write_metadata(root: &Path) -> std::io::Result<()> {
    write_manifest_plist(&root.join(MANIFEST_PLIST), "10.0", "device-1");
    write_status_plist(&root.join(STATUS_PLIST), 1_500_000_000);
    std::fs::write(root.join("Info.plist"), b"")?;
    Ok(())
}

#[derive(Debug, Clone)]
enum FixtureKind {
    Directory,
    File {
        contents: Vec<u8>,
        digest: Option<Vec<u8>>,
        stored: bool,
    },
    Symlink(Option<String>),
}

#[derive(Debug, Clone)]
struct FixtureEntry {
    domain: String,
    path: String,
    kind: FixtureKind,
}

/// Builder for a complete backup directory in a temporary location
#[derive(Debug, Clone)]
pub struct BackupFixture {
    backup_type: BackupType,
    entries: Vec<FixtureEntry>,
}

/// A built backup; the directory lives as long as this value.
pub struct Fixture {
    dir: TempDir,
}

impl Fixture {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl BackupFixture {
    pub fn legacy() -> Self {
        Self {
            backup_type: BackupType::LegacyBinary,
            entries: Vec::new(),
        }
    }

    pub fn relational() -> Self {
        Self {
            backup_type: BackupType::Relational,
            entries: Vec::new(),
        }
    }

    fn push(mut self, domain: &str, path: &str, kind: FixtureKind) -> Self {
        self.entries.push(FixtureEntry {
            domain: domain.into(),
            path: path.into(),
            kind,
        });
        self
    }

    pub fn directory(self, domain: &str, path: &str) -> Self {
        self.push(domain, path, FixtureKind::Directory)
    }

    pub fn file(self, domain: &str, path: &str, contents: &[u8]) -> Self {
        self.push(
            domain,
            path,
            FixtureKind::File {
                contents: contents.to_vec(),
                digest: None,
                stored: true,
            },
        )
    }

    pub fn file_with_digest(
        self,
        domain: &str,
        path: &str,
        contents: &[u8],
        digest: &[u8],
    ) -> Self {
        self.push(
            domain,
            path,
            FixtureKind::File {
                contents: contents.to_vec(),
                digest: Some(digest.to_vec()),
                stored: true,
            },
        )
    }

    /// Record a regular file whose data is missing from storage.
    pub fn file_without_data(self, domain: &str, path: &str, contents: &[u8]) -> Self {
        self.push(
            domain,
            path,
            FixtureKind::File {
                contents: contents.to_vec(),
                digest: None,
                stored: false,
            },
        )
    }

    pub fn symlink(self, domain: &str, path: &str, target: Option<&str>) -> Self {
        self.push(domain, path, FixtureKind::Symlink(target.map(str::to_string)))
    }

    pub fn build(&self) -> std::io::Result<Fixture> {
        let dir = TempDir::new()?;
        let root = dir.path();
        write_metadata(root)?;

        for entry in &self.entries {
            if let FixtureKind::File { contents, stored: true, .. } = &entry.kind {
                if contents.is_empty() {
                    continue;
                }
                let id = file_id(&entry.domain, &entry.path);
                let target = storage_path_for(self.backup_type, root, &id);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, contents)?;
            }
        }

        match self.backup_type {
            BackupType::LegacyBinary => {
                let mut bytes = mbdb_header();
                for entry in &self.entries {
                    let record = match &entry.kind {
                        FixtureKind::Directory => MbdbEntry::directory(&entry.domain, &entry.path),
                        FixtureKind::File { contents, digest, .. } => {
                            let size = contents.len() as u64;
                            let mut e = MbdbEntry::file(&entry.domain, &entry.path, size);
                            e.digest = digest.clone();
                            e
                        }
                        FixtureKind::Symlink(target) => {
                            MbdbEntry::symlink(&entry.domain, &entry.path, target.as_deref())
                        }
                    };
                    record.write_to(&mut bytes);
                }
                std::fs::write(root.join(MANIFEST_MBDB), bytes)?;
            }
            BackupType::Relational => {
                let rows: Vec<DbEntry> = self
                    .entries
                    .iter()
                    .map(|entry| {
                        let archived = match &entry.kind {
                            FixtureKind::Directory => ArchivedEntry::directory(&entry.path),
                            FixtureKind::File { contents, digest, .. } => {
                                let mut a = ArchivedEntry::file(&entry.path, contents.len() as u64);
                                a.digest = digest.clone();
                                a
                            }
                            FixtureKind::Symlink(target) => {
                                let mut a = ArchivedEntry::symlink(&entry.path, "");
                                a.link_target = target.clone();
                                a
                            }
                        };
                        DbEntry::new(&entry.domain, archived)
                    })
                    .collect();
                write_manifest_db(&root.join(MANIFEST_DB), &rows);
            }
        }

        Ok(Fixture { dir })
    }
}
