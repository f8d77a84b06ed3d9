pub mod gadget;
pub mod primitives;

pub use gadget::{
    GadgetInfo, RelativeOffset, Volume, VolumeContent, VolumeStructure, VolumeUpdate,
};
pub use primitives::bytes::{ByteSize, Offset};

/// Returns true if the given value is equal to its default value.
/// Useful for #[serde(skip_serializing_if = "is_default")]
fn is_default<T: Default + PartialEq>(t: &T) -> bool {
    *t == Default::default()
}
