//! Decides whether the transition between two positioned volumes is legal.

use gadget_api::{
    gadget::{ROLE_SYSTEM_BOOT, ROLE_SYSTEM_DATA, TYPE_BARE, TYPE_MBR},
    ByteSize, Offset,
};

use crate::layout::{PositionedStructure, PositionedVolume};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VolumeChangeError {
    #[error("cannot change volume schema from {from:?} to {to:?}")]
    SchemaChange { from: String, to: String },

    #[error("cannot change volume ID from {from:?} to {to:?}")]
    IdChange { from: String, to: String },

    #[error("cannot change the number of structures within volume from {from} to {to}")]
    StructureCountChange { from: usize, to: usize },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StructureChangeError {
    #[error("cannot change structure size from {from} to {to}")]
    SizeChange { from: ByteSize, to: ByteSize },

    #[error("cannot change structure offset from {from} to {to}")]
    OffsetChange { from: String, to: String },

    #[error("cannot change structure start offset from {from} to {to}")]
    StartOffsetChange { from: Offset, to: Offset },

    #[error("cannot change structure offset-write from {from} to {to}")]
    OffsetWriteChange { from: String, to: String },

    #[error("cannot change structure role from {from:?} to {to:?}")]
    RoleChange { from: String, to: String },

    #[error("cannot change structure type from {from:?} to {to:?}")]
    TypeChange { from: String, to: String },

    #[error("cannot change structure ID from {from:?} to {to:?}")]
    IdChange { from: String, to: String },

    #[error("cannot change a filesystem structure to a bare one")]
    FilesystemToBare,

    #[error("cannot change a bare structure to filesystem one")]
    BareToFilesystem,

    #[error("cannot change filesystem from {from:?} to {to:?}")]
    FilesystemChange { from: String, to: String },

    #[error("cannot change filesystem label from {from:?} to {to:?}")]
    LabelChange { from: String, to: String },
}

/// The filesystem label implied by a structure role, used when an update adds
/// an explicit label that was previously implicit.
pub fn implicit_filesystem_label(role: &str) -> Option<&'static str> {
    match role {
        ROLE_SYSTEM_DATA => Some("writable"),
        ROLE_SYSTEM_BOOT => Some("system-boot"),
        _ => None,
    }
}

/// Checks whether the volume-level properties permit an update at all.
pub fn can_update_volume(
    from: &PositionedVolume<'_>,
    to: &PositionedVolume<'_>,
) -> Result<(), VolumeChangeError> {
    let (from_schema, to_schema) = (
        from.volume.effective_schema(),
        to.volume.effective_schema(),
    );
    if from_schema != to_schema {
        return Err(VolumeChangeError::SchemaChange {
            from: from_schema.to_owned(),
            to: to_schema.to_owned(),
        });
    }
    if from.volume.id != to.volume.id {
        return Err(VolumeChangeError::IdChange {
            from: from.volume.id.clone(),
            to: to.volume.id.clone(),
        });
    }
    if from.structures.len() != to.structures.len() {
        return Err(VolumeChangeError::StructureCountChange {
            from: from.structures.len(),
            to: to.structures.len(),
        });
    }
    Ok(())
}

/// Checks whether one structure may transition to its updated counterpart.
/// Structures must keep their size, position and identity; the only permitted
/// relaxations are documented per attribute below.
pub fn can_update_structure(
    from: &PositionedStructure<'_>,
    to: &PositionedStructure<'_>,
) -> Result<(), StructureChangeError> {
    if from.size != to.size {
        return Err(StructureChangeError::SizeChange {
            from: from.size,
            to: to.size,
        });
    }
    if from.offset != to.offset {
        return Err(StructureChangeError::OffsetChange {
            from: render_or_unspecified(from.offset),
            to: render_or_unspecified(to.offset),
        });
    }
    // Catches positioning drift even when the declarations agree
    if from.start_offset != to.start_offset {
        return Err(StructureChangeError::StartOffsetChange {
            from: from.start_offset,
            to: to.start_offset,
        });
    }
    if from.offset_write != to.offset_write {
        return Err(StructureChangeError::OffsetWriteChange {
            from: render_or_unspecified(from.offset_write.as_ref()),
            to: render_or_unspecified(to.offset_write.as_ref()),
        });
    }
    if from.effective_role() != to.effective_role() {
        return Err(StructureChangeError::RoleChange {
            from: from.role.clone(),
            to: to.role.clone(),
        });
    }
    if from.structure_type != to.structure_type {
        // A legacy "mbr" type may become an explicit bare structure with the
        // mbr role; the effective roles were checked equal above. The reverse
        // transition is forbidden.
        let legacy_mbr = from.structure_type == TYPE_MBR && to.structure_type == TYPE_BARE;
        if !legacy_mbr {
            return Err(StructureChangeError::TypeChange {
                from: from.structure_type.clone(),
                to: to.structure_type.clone(),
            });
        }
    }
    if from.id != to.id {
        return Err(StructureChangeError::IdChange {
            from: from.id.clone(),
            to: to.id.clone(),
        });
    }
    match (from.is_bare(), to.is_bare()) {
        (true, false) => return Err(StructureChangeError::BareToFilesystem),
        (false, true) => return Err(StructureChangeError::FilesystemToBare),
        _ => {}
    }
    if !from.is_bare() {
        if from.filesystem != to.filesystem {
            return Err(StructureChangeError::FilesystemChange {
                from: from.filesystem.clone(),
                to: to.filesystem.clone(),
            });
        }
        if from.label != to.label {
            // A label may only appear where there was none, and only when it
            // spells out the label the role already implied
            let implied = implicit_filesystem_label(to.effective_role());
            if !(from.label.is_empty() && implied == Some(to.label.as_str())) {
                return Err(StructureChangeError::LabelChange {
                    from: from.label.clone(),
                    to: to.label.clone(),
                });
            }
        }
    }
    Ok(())
}

fn render_or_unspecified<T: std::fmt::Display>(value: Option<T>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "unspecified".to_owned(),
    }
}
