//! Declarative description of a device's block storage layout: named volumes,
//! their structures (raw byte regions or filesystem partitions), and the
//! content each structure carries.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    is_default,
    primitives::bytes::{ByteSize, Offset},
};

/// Partition table schema of a GPT volume.
pub const SCHEMA_GPT: &str = "gpt";
/// Partition table schema of an MBR volume.
pub const SCHEMA_MBR: &str = "mbr";

/// Structure role covering the MBR bootstrap area.
pub const ROLE_MBR: &str = "mbr";
/// Structure role for the boot partition.
pub const ROLE_SYSTEM_BOOT: &str = "system-boot";
/// Structure role for the writable data partition.
pub const ROLE_SYSTEM_DATA: &str = "system-data";

/// Structure type of a raw region with no partition table entry.
pub const TYPE_BARE: &str = "bare";
/// Legacy structure type implying the mbr role.
pub const TYPE_MBR: &str = "mbr";

/// The MBR bootstrap code area ends where the partition table begins.
pub const MBR_BOOTSTRAP_SIZE: ByteSize = ByteSize(446);

/// The full declarative gadget description consumed by the update engine.
///
/// Produced by an external parser; never mutated during a transition.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GadgetInfo {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Volume>,
}

/// One contiguous storage target, typically a whole block device.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Volume {
    /// Name of the bootloader managed by this volume.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bootloader: String,

    /// Partition table schema, either "gpt" (the default) or "mbr".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema: String,

    /// Disk identifier (GUID).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Ordered list of structures laid out on this volume.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub structure: Vec<VolumeStructure>,
}

impl Volume {
    /// The schema with the implicit default applied.
    pub fn effective_schema(&self) -> &str {
        if self.schema.is_empty() {
            SCHEMA_GPT
        } else {
            &self.schema
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.schema.as_str() {
            "" | SCHEMA_GPT | SCHEMA_MBR => {}
            other => {
                return Err(ValidationError::InvalidSchema {
                    schema: other.to_owned(),
                })
            }
        }
        for (index, structure) in self.structure.iter().enumerate() {
            structure
                .validate()
                .map_err(|source| ValidationError::InvalidStructure {
                    index,
                    name: structure.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// One region of a volume, either a raw byte range or a filesystem partition.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VolumeStructure {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Partition type: "bare", a two-hex-digit MBR type, a GUID, a hybrid
    /// "HH,GUID", or the legacy token "mbr".
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub structure_type: String,

    /// Optional role: "mbr", "system-boot" or "system-data".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,

    /// Partition identifier (GUID).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    pub size: ByteSize,

    /// Explicit start offset within the volume. When unset, the structure is
    /// positioned right after the preceding one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<Offset>,

    /// Location at which the resolved start offset of this structure is to be
    /// written, e.g. into the bootstrap area for chainloaders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_write: Option<RelativeOffset>,

    /// Filesystem type; empty or "none" makes this a bare structure.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filesystem: String,

    #[serde(
        rename = "filesystem-label",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub label: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<VolumeContent>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub update: VolumeUpdate,
}

impl VolumeStructure {
    /// True when the structure is a raw byte region rather than a filesystem.
    pub fn is_bare(&self) -> bool {
        matches!(self.filesystem.as_str(), "" | "none")
    }

    pub fn has_filesystem(&self) -> bool {
        !self.is_bare()
    }

    /// The role with the legacy "mbr" type token folded in.
    pub fn effective_role(&self) -> &str {
        if !self.role.is_empty() {
            &self.role
        } else if self.structure_type == TYPE_MBR {
            ROLE_MBR
        } else {
            ""
        }
    }

    pub fn is_mbr(&self) -> bool {
        self.effective_role() == ROLE_MBR
    }

    pub fn validate(&self) -> Result<(), StructureValidationError> {
        validate_structure_type(&self.structure_type)?;
        match self.role.as_str() {
            "" | ROLE_MBR | ROLE_SYSTEM_BOOT | ROLE_SYSTEM_DATA => {}
            other => {
                return Err(StructureValidationError::InvalidRole {
                    role: other.to_owned(),
                })
            }
        }
        if !self.id.is_empty() && Uuid::parse_str(&self.id).is_err() {
            return Err(StructureValidationError::InvalidId {
                id: self.id.clone(),
            });
        }
        if self.is_mbr() {
            if self.size > MBR_BOOTSTRAP_SIZE {
                return Err(StructureValidationError::MbrOversized { size: self.size });
            }
            if matches!(self.offset, Some(offset) if offset != Offset::ZERO) {
                return Err(StructureValidationError::MbrNotAtStart);
            }
        }
        for content in &self.content {
            match (self.is_bare(), content) {
                (true, VolumeContent::RawImage { .. }) => {}
                (false, VolumeContent::Filesystem { .. }) => {}
                (true, VolumeContent::Filesystem { .. }) => {
                    return Err(StructureValidationError::UnexpectedFilesystemContent)
                }
                (false, VolumeContent::RawImage { .. }) => {
                    return Err(StructureValidationError::UnexpectedRawContent)
                }
            }
        }
        Ok(())
    }
}

/// Content carried by a structure. Bare structures list raw images to be
/// written at byte offsets; filesystem structures list source paths from the
/// gadget root to be synced to target paths inside the filesystem.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum VolumeContent {
    RawImage {
        /// File name of the image in the gadget root directory.
        image: String,

        /// Offset within the structure; defaults to right after the previous
        /// content item.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<Offset>,

        #[serde(
            rename = "offset-write",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        offset_write: Option<RelativeOffset>,

        /// Size of the disk region; defaults to the image file size.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<ByteSize>,
    },
    Filesystem {
        /// Path in the gadget root directory, a file or a directory.
        source: String,

        /// Path inside the filesystem.
        target: String,

        /// Extract the source archive into the target instead of copying it.
        #[serde(default, skip_serializing_if = "is_default")]
        unpack: bool,
    },
}

impl VolumeContent {
    /// A short identification of the entry, for error messages.
    pub fn describe(&self) -> &str {
        match self {
            VolumeContent::RawImage { image, .. } => image,
            VolumeContent::Filesystem { source, .. } => source,
        }
    }
}

/// Update policy of a single structure.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VolumeUpdate {
    /// Monotonically increasing per-structure counter. A structure is applied
    /// on update only when the new edition is strictly greater than the old.
    #[serde(default, skip_serializing_if = "is_default")]
    pub edition: u64,

    /// Target paths that update must never overwrite.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preserve: Vec<String>,
}

/// An offset expressed relative to the start of a named structure, or to the
/// start of the volume when the name is empty.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelativeOffset {
    pub relative_to: String,
    pub offset: Offset,
}

impl Display for RelativeOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.relative_to.is_empty() {
            write!(f, "{}", self.offset)
        } else {
            write!(f, "{}+{}", self.relative_to, self.offset)
        }
    }
}

impl FromStr for RelativeOffset {
    type Err = ParseRelativeOffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (relative_to, offset) = match s.split_once('+') {
            Some((name, offset)) => (name, offset),
            None => ("", s),
        };
        if relative_to.is_empty() && s.contains('+') {
            return Err(ParseRelativeOffsetError::EmptyName {
                input: s.to_owned(),
            });
        }
        let offset = Offset::from_str(offset).map_err(|_| ParseRelativeOffsetError::BadOffset {
            input: s.to_owned(),
        })?;
        Ok(RelativeOffset {
            relative_to: relative_to.to_owned(),
            offset,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseRelativeOffsetError {
    #[error("invalid relative offset {input:?}: structure name is empty")]
    EmptyName { input: String },
    #[error("invalid relative offset {input:?}: offset is not a valid size")]
    BadOffset { input: String },
}

// Relative offsets are written in the gadget description as "<name>+<offset>"
// or a plain offset, so (de)serialize through the string form.
impl<'de> Deserialize<'de> for RelativeOffset {
    fn deserialize<D>(deserializer: D) -> Result<RelativeOffset, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(s) => {
                RelativeOffset::from_str(&s).map_err(serde::de::Error::custom)
            }
            serde_yaml::Value::Number(n) => {
                let n = n.as_u64().ok_or_else(|| {
                    serde::de::Error::custom("invalid relative offset, expected unsigned integer")
                })?;
                Ok(RelativeOffset {
                    relative_to: String::new(),
                    offset: Offset(n),
                })
            }
            _ => Err(serde::de::Error::custom("invalid relative offset")),
        }
    }
}

impl Serialize for RelativeOffset {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if self.relative_to.is_empty() {
            serializer.serialize_u64(self.offset.bytes())
        } else {
            serializer.serialize_str(&self.to_string())
        }
    }
}

fn validate_structure_type(structure_type: &str) -> Result<(), StructureValidationError> {
    let invalid = || StructureValidationError::InvalidType {
        structure_type: structure_type.to_owned(),
    };

    let is_mbr_type = |s: &str| s.len() == 2 && s.bytes().all(|b| b.is_ascii_hexdigit());
    let is_guid = |s: &str| s.len() == 36 && Uuid::parse_str(s).is_ok();

    match structure_type {
        "" | TYPE_BARE | TYPE_MBR => Ok(()),
        s if is_mbr_type(s) || is_guid(s) => Ok(()),
        s => match s.split_once(',') {
            Some((mbr_type, guid)) if is_mbr_type(mbr_type) && is_guid(guid) => Ok(()),
            _ => Err(invalid()),
        },
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid schema {schema:?}, must be one of \"gpt\" or \"mbr\"")]
    InvalidSchema { schema: String },

    #[error("invalid structure #{index} ({name:?}): {source}")]
    InvalidStructure {
        index: usize,
        name: String,
        source: StructureValidationError,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StructureValidationError {
    #[error("invalid type {structure_type:?}")]
    InvalidType { structure_type: String },

    #[error("invalid role {role:?}, must be one of \"mbr\", \"system-boot\" or \"system-data\"")]
    InvalidRole { role: String },

    #[error("invalid ID {id:?}, must be a GUID")]
    InvalidId { id: String },

    #[error("mbr structure size {size} exceeds the bootstrap area of 446 bytes")]
    MbrOversized { size: ByteSize },

    #[error("mbr structure must start at offset 0")]
    MbrNotAtStart,

    #[error("bare structure must only carry image content")]
    UnexpectedFilesystemContent,

    #[error("filesystem structure must only carry source/target content")]
    UnexpectedRawContent,
}
