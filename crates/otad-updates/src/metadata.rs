//! Parsed update packages.
//!
//! An [`UpdateMetadata`] is the immutable form of the server's upgrade
//! response: a product uid, one or two ordered object groups, and the
//! hardware the package declares itself compatible with. The raw
//! response bytes are retained so the package fingerprint is stable no
//! matter how the JSON was formatted.

use crate::object::Object;
use crate::{MetadataError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// One hardware/revision pair a package supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareRequirement {
    pub hardware: String,

    #[serde(rename = "hardware-revision", default)]
    pub revision: String,
}

/// Hardware a package declares itself compatible with.
///
/// On the wire this is either the string `"any"` or a list of
/// hardware/revision pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SupportedHardware {
    #[default]
    Any,
    List(Vec<HardwareRequirement>),
}

impl Serialize for SupportedHardware {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            SupportedHardware::Any => serializer.serialize_str("any"),
            SupportedHardware::List(list) => list.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SupportedHardware {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Tag(String),
            List(Vec<HardwareRequirement>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Tag(tag) if tag == "any" => Ok(SupportedHardware::Any),
            Raw::Tag(tag) => Err(D::Error::custom(format!(
                "expected \"any\" or a hardware list, got \"{tag}\""
            ))),
            Raw::List(list) => Ok(SupportedHardware::List(list)),
        }
    }
}

/// The immutable parsed form of a server upgrade response.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateMetadata {
    #[serde(rename = "product-uid")]
    pub product_uid: String,

    #[serde(rename = "supported-hardware", default)]
    pub supported_hardware: SupportedHardware,

    /// One group per slot: a single group for single-slot packages,
    /// two for active/inactive packages.
    pub objects: Vec<Vec<Object>>,

    #[serde(skip)]
    raw: Vec<u8>,
}

impl UpdateMetadata {
    /// Parse a package from the raw server response body.
    ///
    /// A package with an object group count other than 1 or 2 is
    /// rejected here, before any state can be built on top of it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut metadata: UpdateMetadata = serde_json::from_slice(bytes)?;

        let groups = metadata.objects.len();
        if !(1..=2).contains(&groups) {
            return Err(MetadataError::ObjectGroupCount(groups));
        }

        metadata.raw = bytes.to_vec();
        Ok(metadata)
    }

    /// The package fingerprint: lowercase hex SHA-256 of the raw
    /// response bytes.
    pub fn package_uid(&self) -> String {
        hex::encode(Sha256::digest(&self.raw))
    }

    /// The raw response bytes this package was parsed from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}
