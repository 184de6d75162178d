//! Mode-specific install handlers.
//!
//! Every object is driven through the same three steps: `setup`,
//! `install`, `cleanup`. The pipeline guarantees `cleanup` runs for
//! every object whose `setup` ran, whatever `install` did.

use otad_updates::{InstallMode, Object};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{AgentError, Result};

const SECTOR_SIZE: u64 = 512;
const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// One object's walk through the install pipeline.
pub trait InstallHandler {
    fn setup(&mut self) -> Result<()>;
    fn install(&mut self, download_dir: &Path) -> Result<()>;
    fn cleanup(&mut self) -> Result<()>;
}

/// Produces the handler for an object's install mode.
pub type HandlerFactory =
    Box<dyn Fn(&Object) -> Result<Box<dyn InstallHandler + Send>> + Send + Sync>;

/// The built-in mode-to-handler mapping.
pub fn default_factory() -> HandlerFactory {
    Box::new(|object| match object.mode {
        InstallMode::Copy => Ok(Box::new(CopyHandler::new(object.clone()))),
        InstallMode::Raw | InstallMode::Flash | InstallMode::Imxkobs => {
            Ok(Box::new(RawHandler::new(object.clone())))
        }
        mode => Err(AgentError::UnsupportedMode(mode.to_string())),
    })
}

/// Whole-file copy onto a mounted filesystem target.
pub struct CopyHandler {
    object: Object,
}

impl CopyHandler {
    pub fn new(object: Object) -> Self {
        Self { object }
    }
}

impl InstallHandler for CopyHandler {
    fn setup(&mut self) -> Result<()> {
        if self.object.target.is_empty() {
            return Err(AgentError::Install("copy object has no target".to_string()));
        }
        if self.object.bool_option("compressed") {
            return Err(AgentError::Install(
                "compressed objects are not supported by the copy handler".to_string(),
            ));
        }
        Ok(())
    }

    fn install(&mut self, download_dir: &Path) -> Result<()> {
        let source = download_dir.join(&self.object.sha256sum);
        info!(
            "copying {} to {}",
            source.display(),
            self.object.target
        );

        let written = std::fs::copy(&source, &self.object.target)
            .map_err(|e| AgentError::Install(format!("copy to {}: {e}", self.object.target)))?;

        debug!("copied {written} bytes to {}", self.object.target);
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Raw write to a block device, sector granular.
///
/// Options: `seek` (output offset in sectors), `skip` (input offset in
/// sectors), `chunk-size` (copy buffer bytes), `truncate`.
pub struct RawHandler {
    object: Object,
}

impl RawHandler {
    pub fn new(object: Object) -> Self {
        Self { object }
    }
}

impl InstallHandler for RawHandler {
    fn setup(&mut self) -> Result<()> {
        if self.object.target.is_empty() {
            return Err(AgentError::Install("raw object has no target".to_string()));
        }
        Ok(())
    }

    fn install(&mut self, download_dir: &Path) -> Result<()> {
        let source_path = download_dir.join(&self.object.sha256sum);
        let seek = self.object.u64_option("seek").unwrap_or(0) * SECTOR_SIZE;
        let skip = self.object.u64_option("skip").unwrap_or(0) * SECTOR_SIZE;
        let chunk_size = self
            .object
            .u64_option("chunk-size")
            .map(|size| size as usize)
            .unwrap_or(DEFAULT_CHUNK_SIZE);

        info!(
            "writing {} to {} (seek {seek}, skip {skip})",
            source_path.display(),
            self.object.target
        );

        let mut source = File::open(&source_path)
            .map_err(|e| AgentError::Install(format!("open {}: {e}", source_path.display())))?;
        source
            .seek(SeekFrom::Start(skip))
            .map_err(|e| AgentError::Install(format!("skip in {}: {e}", source_path.display())))?;

        let mut target = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(self.object.bool_option("truncate"))
            .open(&self.object.target)
            .map_err(|e| AgentError::Install(format!("open {}: {e}", self.object.target)))?;
        target
            .seek(SeekFrom::Start(seek))
            .map_err(|e| AgentError::Install(format!("seek in {}: {e}", self.object.target)))?;

        let mut buffer = vec![0u8; chunk_size];
        let mut written: u64 = 0;
        loop {
            let read = source
                .read(&mut buffer)
                .map_err(|e| AgentError::Install(format!("read {}: {e}", source_path.display())))?;
            if read == 0 {
                break;
            }
            target
                .write_all(&buffer[..read])
                .map_err(|e| AgentError::Install(format!("write {}: {e}", self.object.target)))?;
            written += read as u64;
        }

        target
            .sync_all()
            .map_err(|e| AgentError::Install(format!("sync {}: {e}", self.object.target)))?;

        debug!("wrote {written} bytes to {}", self.object.target);
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}
