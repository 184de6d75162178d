//! Active/inactive slot selection.
//!
//! Two-group update packages target the slot the device is *not*
//! booted from; the slot index flips only after a fully successful
//! install, so a crash mid-install leaves the boot selection alone.

use otad_updates::UpdateMetadata;
use std::fs;
use std::path::PathBuf;

use crate::error::{AgentError, Result};

/// Backend owning the durable active-slot index.
pub trait ActiveInactive: Send + Sync {
    /// Index of the slot the device currently boots from (0 or 1).
    fn active(&self) -> Result<usize>;

    /// Mark a slot as the one to boot from next.
    fn set_active(&self, index: usize) -> Result<()>;
}

/// File-backed slot store. A missing file means slot 0.
pub struct SlotFile {
    path: PathBuf,
}

impl SlotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ActiveInactive for SlotFile {
    fn active(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| AgentError::Slot(format!("reading {}: {e}", self.path.display())))?;

        match contents.trim() {
            "0" => Ok(0),
            "1" => Ok(1),
            other => Err(AgentError::Slot(format!(
                "invalid active slot index {other:?} in {}",
                self.path.display()
            ))),
        }
    }

    fn set_active(&self, index: usize) -> Result<()> {
        if index > 1 {
            return Err(AgentError::Slot(format!("invalid slot index {index}")));
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AgentError::Slot(format!("creating {}: {e}", parent.display())))?;
        }

        fs::write(&self.path, format!("{index}\n"))
            .map_err(|e| AgentError::Slot(format!("writing {}: {e}", self.path.display())))
    }
}

/// Which object group of a package this device installs.
///
/// Single-group packages always install group 0; two-group packages
/// install the inactive slot.
pub fn index_to_install(slots: &dyn ActiveInactive, update: &UpdateMetadata) -> Result<usize> {
    match update.objects.len() {
        1 => Ok(0),
        2 => {
            let active = slots.active()?;
            if active > 1 {
                return Err(AgentError::Slot(format!("invalid active slot {active}")));
            }
            Ok(1 - active)
        }
        count => Err(AgentError::ObjectGroupCount(count)),
    }
}
