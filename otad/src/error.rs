//! Agent error classification.
//!
//! Every failure the state machine can observe is either *transient*
//! (loop back to Idle and retry on the next poll) or *fatal* (stop the
//! daemon with exit code 1). The classification lives on the error
//! itself so state handlers only route, never decide.

use thiserror::Error;

/// Errors surfaced to the state machine.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("update check failed: {0}")]
    Probe(String),

    #[error("download failed: {0}")]
    Fetch(String),

    #[error("sha256sum mismatch for {object}: expected {expected}, calculated {calculated}")]
    ChecksumMismatch {
        object: String,
        expected: String,
        calculated: String,
    },

    #[error("hardware {hardware} (revision {revision}) is not supported by this update")]
    IncompatibleHardware { hardware: String, revision: String },

    #[error("install mode {0} is not supported on this device")]
    UnsupportedMode(String),

    #[error("update package must have 1 or 2 object groups, found {0}")]
    ObjectGroupCount(usize),

    #[error("install failed: {0}")]
    Install(String),

    #[error("active slot backend failed: {0}")]
    Slot(String),

    #[error("failed to persist settings: {0}")]
    SettingsPersist(String),

    #[error(transparent)]
    Metadata(#[from] otad_updates::MetadataError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Fatal errors terminate the daemon; everything else returns the
    /// machine to Idle for a later retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::SettingsPersist(_)
                | AgentError::ObjectGroupCount(_)
                | AgentError::Metadata(otad_updates::MetadataError::ObjectGroupCount(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
