//! Update package and firmware metadata for the otad agent
//!
//! This crate provides:
//! - Parsed update packages (the server's upgrade response)
//! - Per-object install metadata and modes
//! - Device firmware identity and hardware compatibility checks
//! - The SHA-256 package fingerprint used to recognize re-offered updates

pub mod firmware;
pub mod metadata;
pub mod object;

pub use firmware::FirmwareMetadata;
pub use metadata::{HardwareRequirement, SupportedHardware, UpdateMetadata};
pub use object::{InstallMode, Object};

use thiserror::Error;

/// Error types for update metadata
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("update package must have 1 or 2 object groups, found {0}")]
    ObjectGroupCount(usize),

    #[error("invalid product uid: {0}")]
    InvalidProductUid(String),

    #[error("malformed update package: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MetadataError>;
