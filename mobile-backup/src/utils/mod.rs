//! Utility modules shared by the backup reader.

pub mod cancel;
pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result};
