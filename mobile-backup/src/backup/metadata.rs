//! Typed view of `Manifest.plist` and `Status.plist`.
//!
//! Only the handful of fields the reader and the CLI need are kept; unknown
//! keys are ignored.

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

pub const MANIFEST_PLIST: &str = "Manifest.plist";
pub const STATUS_PLIST: &str = "Status.plist";

/// Device and backup description from `Manifest.plist`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManifestInfo {
    /// Backup format version, e.g. "9.1" or "10.0"
    pub version: Option<String>,
    pub is_encrypted: bool,
    pub date: Option<DateTime<Utc>>,
    pub device: DeviceInfo,
    /// Bundle identifiers of the backed-up applications
    pub applications: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub unique_device_id: Option<String>,
    pub device_name: Option<String>,
    pub product_type: Option<String>,
    pub product_version: Option<String>,
    pub build_version: Option<String>,
    pub serial_number: Option<String>,
}

/// Backup state from `Status.plist`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusInfo {
    pub version: Option<String>,
    pub is_full_backup: bool,
    pub backup_state: Option<String>,
    pub snapshot_state: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawManifest {
    version: Option<String>,
    #[serde(default)]
    is_encrypted: bool,
    date: Option<plist::Date>,
    #[serde(default)]
    lockdown: RawLockdown,
    #[serde(default)]
    applications: BTreeMap<String, plist::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawLockdown {
    #[serde(rename = "UniqueDeviceID")]
    unique_device_id: Option<String>,
    device_name: Option<String>,
    product_type: Option<String>,
    product_version: Option<String>,
    build_version: Option<String>,
    serial_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStatus {
    version: Option<String>,
    #[serde(default)]
    is_full_backup: bool,
    backup_state: Option<String>,
    snapshot_state: Option<String>,
    date: Option<plist::Date>,
    #[serde(rename = "UUID")]
    uuid: Option<String>,
}

fn to_utc(date: plist::Date) -> DateTime<Utc> {
    DateTime::<Utc>::from(SystemTime::from(date))
}

fn read_plist<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    plist::from_file(path)
        .map_err(|e| BackupError::Metadata(format!("{}: {}", path.display(), e)))
}

impl ManifestInfo {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw: RawManifest = read_plist(path)?;
        Ok(Self {
            version: raw.version,
            is_encrypted: raw.is_encrypted,
            date: raw.date.map(to_utc),
            device: DeviceInfo {
                unique_device_id: raw.lockdown.unique_device_id,
                device_name: raw.lockdown.device_name,
                product_type: raw.lockdown.product_type,
                product_version: raw.lockdown.product_version,
                build_version: raw.lockdown.build_version,
                serial_number: raw.lockdown.serial_number,
            },
            applications: raw.applications.into_keys().collect(),
        })
    }
}

impl StatusInfo {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw: RawStatus = read_plist(path)?;
        Ok(Self {
            version: raw.version,
            is_full_backup: raw.is_full_backup,
            backup_state: raw.backup_state,
            snapshot_state: raw.snapshot_state,
            date: raw.date.map(to_utc),
            uuid: raw.uuid,
        })
    }
}
