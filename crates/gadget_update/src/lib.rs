//! The gadget update engine: applies an updated gadget description to a
//! running system with full backup and rollback on any failure.
//!
//! The engine resolves the old and new volume descriptions into concrete byte
//! layouts, checks that the transition is compatible, selects a per-structure
//! update strategy (raw image write or mounted filesystem sync) and drives the
//! whole set as a transaction: back up everything first, then apply, rolling
//! back every touched structure if any single one fails.

pub mod compat;
pub mod layout;
pub mod update;

pub use compat::{
    can_update_structure, can_update_volume, StructureChangeError, VolumeChangeError,
};
pub use layout::{
    position_volume, LayoutError, PositionedContent, PositionedStructure, PositionedVolume,
};
pub use update::{
    update, updater_for_structure, GadgetData, Logger, NoUpdate, StructureUpdater, UpdateError,
    UpdateRunner,
};
