//! Update objects and their install modes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// How an object is written to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    /// Whole-file copy onto a mounted filesystem target
    Copy,
    /// Raw write to a NAND flash target
    Flash,
    /// i.MX kernel object block write
    Imxkobs,
    /// Raw write to a block device, sector granular
    Raw,
    /// Archive unpacked onto a mounted filesystem target
    Tarball,
    /// UBI volume update
    Ubifs,
}

impl InstallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallMode::Copy => "copy",
            InstallMode::Flash => "flash",
            InstallMode::Imxkobs => "imxkobs",
            InstallMode::Raw => "raw",
            InstallMode::Tarball => "tarball",
            InstallMode::Ubifs => "ubifs",
        }
    }
}

impl fmt::Display for InstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single binary payload to be written to one target on the device.
///
/// The file backing an object lives in the download directory under a
/// name equal to its SHA-256, which is also how presence is decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    /// Install mode selecting the handler for this object
    pub mode: InstallMode,

    /// Lowercase hex SHA-256 of the object payload
    pub sha256sum: String,

    /// Payload size in bytes
    pub size: u64,

    /// Device path or filesystem path the object is written to
    pub target: String,

    /// Kind of target ("device", "mtdname", "ubivolume", ...)
    #[serde(rename = "target-type", default)]
    pub target_type: String,

    /// Handler-specific fields (seek/skip/chunk-size, compression, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Object {
    /// Read an integer handler option, e.g. `"seek"` for raw writes.
    pub fn u64_option(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(Value::as_u64)
    }

    /// Read a boolean handler option, absent means `false`.
    pub fn bool_option(&self, key: &str) -> bool {
        self.extra
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Read a string handler option.
    pub fn str_option(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_wire_names() {
        let mode: InstallMode = serde_json::from_str("\"copy\"").unwrap();
        assert_eq!(mode, InstallMode::Copy);
        assert_eq!(serde_json::to_string(&InstallMode::Imxkobs).unwrap(), "\"imxkobs\"");
        assert_eq!(InstallMode::Raw.to_string(), "raw");
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result: Result<InstallMode, _> = serde_json::from_str("\"zephyr\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_object_captures_handler_fields() {
        let object: Object = serde_json::from_str(
            r#"{
                "mode": "raw",
                "sha256sum": "a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3",
                "size": 4096,
                "target": "/dev/mmcblk0",
                "target-type": "device",
                "seek": 8,
                "skip": 2,
                "truncate": true
            }"#,
        )
        .unwrap();

        assert_eq!(object.mode, InstallMode::Raw);
        assert_eq!(object.target_type, "device");
        assert_eq!(object.u64_option("seek"), Some(8));
        assert_eq!(object.u64_option("skip"), Some(2));
        assert!(object.bool_option("truncate"));
        assert_eq!(object.u64_option("count"), None);
        assert!(!object.bool_option("compressed"));
    }
}
