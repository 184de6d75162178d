//! Device firmware identity.
//!
//! Loaded once at startup from `firmware.json` in the firmware
//! directory and immutable afterwards. The identity is sent verbatim
//! as the probe request body, so the field names match the wire
//! protocol.

use crate::metadata::SupportedHardware;
use crate::{MetadataError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Identity of the firmware currently running on the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareMetadata {
    /// 64-char lowercase hex product identifier
    #[serde(rename = "product-uid")]
    pub product_uid: String,

    /// Key/value pairs uniquely identifying this device
    #[serde(rename = "device-identity", default)]
    pub device_identity: BTreeMap<String, String>,

    /// Free-form device attributes forwarded to the server
    #[serde(rename = "device-attributes", default)]
    pub device_attributes: BTreeMap<String, String>,

    pub hardware: String,

    #[serde(rename = "hardware-revision", default)]
    pub hardware_revision: String,

    pub version: String,
}

impl FirmwareMetadata {
    /// Load the firmware identity from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read(path)?;
        let metadata: FirmwareMetadata = serde_json::from_slice(&contents)?;

        if metadata.product_uid.len() != 64
            || !metadata.product_uid.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(MetadataError::InvalidProductUid(metadata.product_uid));
        }

        Ok(metadata)
    }

    /// Whether an update package supports this device's hardware.
    pub fn compatible_with(&self, supported: &SupportedHardware) -> bool {
        match supported {
            SupportedHardware::Any => true,
            SupportedHardware::List(list) => list.iter().any(|requirement| {
                requirement.hardware == self.hardware
                    && requirement.revision == self.hardware_revision
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::HardwareRequirement;
    use std::io::Write;

    fn sample() -> FirmwareMetadata {
        FirmwareMetadata {
            product_uid: "ab".repeat(32),
            device_identity: [("id".to_string(), "serial-1".to_string())].into(),
            device_attributes: BTreeMap::new(),
            hardware: "board-a".to_string(),
            hardware_revision: "rev1".to_string(),
            version: "2.1.0".to_string(),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        serde_json::to_writer(&mut file, &sample()).unwrap();
        file.flush().unwrap();

        let loaded = FirmwareMetadata::from_file(file.path()).unwrap();
        assert_eq!(loaded.product_uid, "ab".repeat(32));
        assert_eq!(loaded.hardware, "board-a");
        assert_eq!(loaded.device_identity["id"], "serial-1");
    }

    #[test]
    fn test_bad_product_uid_rejected() {
        let mut firmware = sample();
        firmware.product_uid = "not-hex".to_string();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        serde_json::to_writer(&mut file, &firmware).unwrap();
        file.flush().unwrap();

        assert!(matches!(
            FirmwareMetadata::from_file(file.path()),
            Err(MetadataError::InvalidProductUid(_))
        ));
    }

    #[test]
    fn test_hardware_compatibility() {
        let firmware = sample();

        assert!(firmware.compatible_with(&SupportedHardware::Any));

        let matching = SupportedHardware::List(vec![HardwareRequirement {
            hardware: "board-a".to_string(),
            revision: "rev1".to_string(),
        }]);
        assert!(firmware.compatible_with(&matching));

        let wrong_revision = SupportedHardware::List(vec![HardwareRequirement {
            hardware: "board-a".to_string(),
            revision: "rev2".to_string(),
        }]);
        assert!(!firmware.compatible_with(&wrong_revision));

        let other_board = SupportedHardware::List(vec![HardwareRequirement {
            hardware: "board-b".to_string(),
            revision: "rev1".to_string(),
        }]);
        assert!(!firmware.compatible_with(&other_board));
    }
}
