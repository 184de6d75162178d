//! The install pipeline.
//!
//! Given a parsed update package and the object group selected for
//! this device, the pipeline re-verifies every object file, then walks
//! each object through its handler: setup, an install-if-different
//! gate, install, and an unconditional cleanup. Errors are collected
//! so cleanup always runs before the pipeline fails; the active slot
//! flips only after the whole group installed.

use otad_updates::{FirmwareMetadata, InstallMode, Object, UpdateMetadata};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::active_inactive::{index_to_install, ActiveInactive};
use crate::error::{AgentError, Result};
use crate::handlers::HandlerFactory;

/// Decides whether a target already holds an object's content.
pub trait InstallIfDifferent: Send + Sync {
    /// `true` means install, `false` means skip (cleanup still runs).
    fn proceed(&self, object: &Object) -> Result<bool>;
}

/// Default policy: objects that carry an `install-if-different` field
/// are skipped when the target already hashes to the object's sum.
pub struct TargetComparison;

impl InstallIfDifferent for TargetComparison {
    fn proceed(&self, object: &Object) -> Result<bool> {
        if !object.extra.contains_key("install-if-different") {
            return Ok(true);
        }

        let target = Path::new(&object.target);
        if !target.exists() {
            return Ok(true);
        }

        let current = file_sha256(target)?;
        if current == object.sha256sum {
            info!(
                "target {} already holds {}, skipping install",
                object.target, object.sha256sum
            );
            Ok(false)
        } else {
            Ok(true)
        }
    }
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Check a downloaded object against its declared sum.
///
/// An object is present iff a file named after its SHA-256 exists in
/// the download dir and hashes to that value. This runs even when the
/// download just completed.
pub fn verify_object(download_dir: &Path, expected: &str) -> Result<()> {
    let path = download_dir.join(expected);
    let calculated = file_sha256(&path)?;

    if calculated != expected {
        return Err(AgentError::ChecksumMismatch {
            object: expected.to_string(),
            expected: expected.to_string(),
            calculated,
        });
    }

    Ok(())
}

/// One install run over a selected object group.
pub struct Installer<'a> {
    pub firmware: &'a FirmwareMetadata,
    pub slots: &'a dyn ActiveInactive,
    pub policy: &'a dyn InstallIfDifferent,
    pub supported_modes: &'a [InstallMode],
    pub factory: &'a HandlerFactory,
    pub read_only: bool,
}

impl<'a> Installer<'a> {
    pub fn install_update(&self, update: &UpdateMetadata, download_dir: &Path) -> Result<()> {
        if self.read_only {
            return Err(AgentError::Install(
                "device storage is read-only".to_string(),
            ));
        }

        if !self.firmware.compatible_with(&update.supported_hardware) {
            return Err(AgentError::IncompatibleHardware {
                hardware: self.firmware.hardware.clone(),
                revision: self.firmware.hardware_revision.clone(),
            });
        }

        let index = index_to_install(self.slots, update)?;
        info!(
            "installing object group {index} of {} ({} objects)",
            update.package_uid(),
            update.objects[index].len()
        );

        for object in &update.objects[index] {
            self.install_object(object, download_dir)?;
        }

        // Two groups means active/inactive is in play: point the
        // bootloader at the freshly installed slot.
        if update.objects.len() == 2 {
            self.slots.set_active(index)?;
            info!("active slot set to {index}");
        }

        Ok(())
    }

    fn install_object(&self, object: &Object, download_dir: &Path) -> Result<()> {
        if !self.supported_modes.contains(&object.mode) {
            return Err(AgentError::UnsupportedMode(object.mode.to_string()));
        }

        verify_object(download_dir, &object.sha256sum)?;

        let mut handler = (self.factory)(object)?;
        let mut errors: Vec<AgentError> = Vec::new();

        debug!("object {}: setup", object.sha256sum);
        let ready = match handler.setup() {
            Ok(()) => true,
            Err(e) => {
                errors.push(e);
                false
            }
        };

        if ready {
            match self.policy.proceed(object) {
                Ok(true) => {
                    debug!("object {}: install", object.sha256sum);
                    if let Err(e) = handler.install(download_dir) {
                        errors.push(e);
                    }
                }
                Ok(false) => {}
                Err(e) => errors.push(e),
            }
        }

        // Cleanup runs for every object whose setup was invoked,
        // whatever happened since.
        debug!("object {}: cleanup", object.sha256sum);
        if let Err(e) = handler.cleanup() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            for error in &errors {
                warn!("object {}: {error}", object.sha256sum);
            }
            Err(merge_errors(errors))
        }
    }
}

fn merge_errors(errors: Vec<AgentError>) -> AgentError {
    let merged = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    AgentError::Install(format!("({} error(s)): {merged}", errors.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::active_inactive::SlotFile;
    use crate::handlers::InstallHandler;
    use otad_updates::SupportedHardware;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    const MODES: &[InstallMode] = &[InstallMode::Copy, InstallMode::Raw, InstallMode::Flash];

    fn firmware() -> FirmwareMetadata {
        FirmwareMetadata {
            product_uid: "ab".repeat(32),
            device_identity: BTreeMap::new(),
            device_attributes: BTreeMap::new(),
            hardware: "board-a".to_string(),
            hardware_revision: "rev1".to_string(),
            version: "2.1.0".to_string(),
        }
    }

    fn sha_of(content: &[u8]) -> String {
        hex::encode(Sha256::digest(content))
    }

    /// Build a single- or two-group package whose objects reference
    /// the given payloads, and drop the payloads in the download dir.
    fn package(download_dir: &Path, groups: &[&[&[u8]]], target: &Path) -> UpdateMetadata {
        let groups_json: Vec<String> = groups
            .iter()
            .map(|group| {
                let objects: Vec<String> = group
                    .iter()
                    .map(|content| {
                        let sha = sha_of(content);
                        std::fs::write(download_dir.join(&sha), content).unwrap();
                        format!(
                            r#"{{ "mode": "copy", "sha256sum": "{sha}", "size": {}, "target": "{}" }}"#,
                            content.len(),
                            target.display()
                        )
                    })
                    .collect();
                format!("[{}]", objects.join(","))
            })
            .collect();

        let body = format!(
            r#"{{ "product-uid": "00", "objects": [{}] }}"#,
            groups_json.join(",")
        );
        UpdateMetadata::from_bytes(body.as_bytes()).unwrap()
    }

    struct AlwaysInstall;
    impl InstallIfDifferent for AlwaysInstall {
        fn proceed(&self, _object: &Object) -> Result<bool> {
            Ok(true)
        }
    }

    /// Handler that records its calls and fails on demand.
    struct Recording {
        log: Arc<Mutex<Vec<String>>>,
        fail_install: bool,
    }

    impl InstallHandler for Recording {
        fn setup(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("setup".to_string());
            Ok(())
        }
        fn install(&mut self, _download_dir: &Path) -> Result<()> {
            self.log.lock().unwrap().push("install".to_string());
            if self.fail_install {
                Err(AgentError::Install("flash write failed".to_string()))
            } else {
                Ok(())
            }
        }
        fn cleanup(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("cleanup".to_string());
            Ok(())
        }
    }

    fn recording_factory(log: Arc<Mutex<Vec<String>>>, fail_install: bool) -> HandlerFactory {
        Box::new(move |_object| {
            Ok(Box::new(Recording {
                log: log.clone(),
                fail_install,
            }))
        })
    }

    struct Fixture {
        download_dir: PathBuf,
        slot_file: SlotFile,
        _dir: tempfile::TempDir,
        target: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join("downloads");
        std::fs::create_dir_all(&download_dir).unwrap();
        Fixture {
            download_dir,
            slot_file: SlotFile::new(dir.path().join("active-slot")),
            target: dir.path().join("target.img"),
            _dir: dir,
        }
    }

    #[test]
    fn test_successful_single_group_install() {
        let fx = fixture();
        let update = package(&fx.download_dir, &[&[b"payload-a"]], &fx.target);
        let fw = firmware();

        let factory = crate::handlers::default_factory();
        let installer = Installer {
            firmware: &fw,
            slots: &fx.slot_file,
            policy: &AlwaysInstall,
            supported_modes: MODES,
            factory: &factory,
            read_only: false,
        };

        installer.install_update(&update, &fx.download_dir).unwrap();
        assert_eq!(std::fs::read(&fx.target).unwrap(), b"payload-a");

        // Single group never touches the slot selection.
        assert_eq!(fx.slot_file.active().unwrap(), 0);
    }

    #[test]
    fn test_pipeline_order_and_cleanup_on_failure() {
        let fx = fixture();
        let update = package(&fx.download_dir, &[&[b"payload-a"]], &fx.target);
        let fw = firmware();

        let log = Arc::new(Mutex::new(Vec::new()));
        let factory = recording_factory(log.clone(), true);
        let installer = Installer {
            firmware: &fw,
            slots: &fx.slot_file,
            policy: &AlwaysInstall,
            supported_modes: MODES,
            factory: &factory,
            read_only: false,
        };

        let result = installer.install_update(&update, &fx.download_dir);
        assert!(matches!(result, Err(AgentError::Install(_))));

        // Cleanup ran even though install failed.
        assert_eq!(*log.lock().unwrap(), vec!["setup", "install", "cleanup"]);
    }

    #[test]
    fn test_skip_still_runs_cleanup() {
        struct NeverInstall;
        impl InstallIfDifferent for NeverInstall {
            fn proceed(&self, _object: &Object) -> Result<bool> {
                Ok(false)
            }
        }

        let fx = fixture();
        let update = package(&fx.download_dir, &[&[b"payload-a"]], &fx.target);
        let fw = firmware();

        let log = Arc::new(Mutex::new(Vec::new()));
        let factory = recording_factory(log.clone(), false);
        let installer = Installer {
            firmware: &fw,
            slots: &fx.slot_file,
            policy: &NeverInstall,
            supported_modes: MODES,
            factory: &factory,
            read_only: false,
        };

        installer.install_update(&update, &fx.download_dir).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["setup", "cleanup"]);
    }

    #[test]
    fn test_checksum_mismatch_detected_before_setup() {
        let fx = fixture();
        let update = package(&fx.download_dir, &[&[b"payload-a"]], &fx.target);
        let fw = firmware();

        // Corrupt the downloaded object.
        let sha = sha_of(b"payload-a");
        std::fs::write(fx.download_dir.join(&sha), b"tampered").unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let factory = recording_factory(log.clone(), false);
        let installer = Installer {
            firmware: &fw,
            slots: &fx.slot_file,
            policy: &AlwaysInstall,
            supported_modes: MODES,
            factory: &factory,
            read_only: false,
        };

        let result = installer.install_update(&update, &fx.download_dir);
        assert!(matches!(result, Err(AgentError::ChecksumMismatch { .. })));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_incompatible_hardware_rejected() {
        let fx = fixture();
        let mut update = package(&fx.download_dir, &[&[b"payload-a"]], &fx.target);
        update.supported_hardware = SupportedHardware::List(vec![]);
        let fw = firmware();

        let factory = crate::handlers::default_factory();
        let installer = Installer {
            firmware: &fw,
            slots: &fx.slot_file,
            policy: &AlwaysInstall,
            supported_modes: MODES,
            factory: &factory,
            read_only: false,
        };

        assert!(matches!(
            installer.install_update(&update, &fx.download_dir),
            Err(AgentError::IncompatibleHardware { .. })
        ));
    }

    #[test]
    fn test_unsupported_mode_rejected() {
        let fx = fixture();
        let update = package(&fx.download_dir, &[&[b"payload-a"]], &fx.target);
        let fw = firmware();

        let factory = crate::handlers::default_factory();
        let installer = Installer {
            firmware: &fw,
            slots: &fx.slot_file,
            policy: &AlwaysInstall,
            supported_modes: &[InstallMode::Raw],
            factory: &factory,
            read_only: false,
        };

        assert!(matches!(
            installer.install_update(&update, &fx.download_dir),
            Err(AgentError::UnsupportedMode(_))
        ));
    }

    #[test]
    fn test_two_groups_flip_slot_only_on_success() {
        let fx = fixture();
        let update = package(
            &fx.download_dir,
            &[&[b"slot-0-image"], &[b"slot-1-image"]],
            &fx.target,
        );
        let fw = firmware();

        // Failing install: slot selection untouched.
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = recording_factory(log, true);
        let installer = Installer {
            firmware: &fw,
            slots: &fx.slot_file,
            policy: &AlwaysInstall,
            supported_modes: MODES,
            factory: &failing,
            read_only: false,
        };
        assert!(installer.install_update(&update, &fx.download_dir).is_err());
        assert_eq!(fx.slot_file.active().unwrap(), 0);

        // Successful install of the inactive group flips to slot 1.
        let factory = crate::handlers::default_factory();
        let installer = Installer {
            firmware: &fw,
            slots: &fx.slot_file,
            policy: &AlwaysInstall,
            supported_modes: MODES,
            factory: &factory,
            read_only: false,
        };
        installer.install_update(&update, &fx.download_dir).unwrap();
        assert_eq!(fx.slot_file.active().unwrap(), 1);
        assert_eq!(std::fs::read(&fx.target).unwrap(), b"slot-1-image");
    }

    #[test]
    fn test_read_only_storage_refuses_install() {
        let fx = fixture();
        let update = package(&fx.download_dir, &[&[b"payload-a"]], &fx.target);
        let fw = firmware();

        let factory = crate::handlers::default_factory();
        let installer = Installer {
            firmware: &fw,
            slots: &fx.slot_file,
            policy: &AlwaysInstall,
            supported_modes: MODES,
            factory: &factory,
            read_only: true,
        };

        assert!(installer.install_update(&update, &fx.download_dir).is_err());
        assert!(!fx.target.exists());
    }

    #[test]
    fn test_install_if_different_policy() {
        let fx = fixture();
        let content = b"same-content";
        let sha = sha_of(content);
        std::fs::write(fx.download_dir.join(&sha), content).unwrap();

        let mut object = Object {
            mode: InstallMode::Copy,
            sha256sum: sha.clone(),
            size: content.len() as u64,
            target: fx.target.display().to_string(),
            target_type: String::new(),
            extra: BTreeMap::new(),
        };
        object
            .extra
            .insert("install-if-different".to_string(), json!("sha256sum"));

        // Target absent: install.
        assert!(TargetComparison.proceed(&object).unwrap());

        // Target holds the same content: skip.
        std::fs::write(&fx.target, content).unwrap();
        assert!(!TargetComparison.proceed(&object).unwrap());

        // Target differs: install.
        std::fs::write(&fx.target, b"stale").unwrap();
        assert!(TargetComparison.proceed(&object).unwrap());

        // Without the field the policy always installs.
        object.extra.clear();
        assert!(TargetComparison.proceed(&object).unwrap());
    }
}
