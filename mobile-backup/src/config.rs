//! Configuration management for the mobile-backup tool.
//!
//! Loads configuration from a TOML file; every field has a default so a
//! partial file is valid. Command-line flags override what is loaded here.

use crate::executor::{LinkMode, DEFAULT_DIR_MODE};
use crate::sync::compare::DEFAULT_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub extract: ExtractConfig,
    pub compare: CompareConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Hard-link extracted files to backup storage instead of copying
    #[serde(default)]
    pub hardlink: bool,

    /// Permission bits for created directories (e.g. `0o750`)
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareConfig {
    /// Chunk size in bytes for stored-data comparison (default: 64KiB)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

// Default values
fn default_log_level() -> String {
    "warn".to_string()
}

fn default_dir_mode() -> u32 {
    DEFAULT_DIR_MODE
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            hardlink: false,
            dir_mode: default_dir_mode(),
        }
    }
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

impl ExtractConfig {
    pub fn link_mode(&self) -> LinkMode {
        if self.hardlink {
            LinkMode::Hardlink
        } else {
            LinkMode::Copy
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
