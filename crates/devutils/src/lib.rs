//! Low-level host utilities shared by the gadget update engine: file tree
//! operations, block device region I/O, digests, process helpers and mount
//! table lookups.

pub mod archive;
pub mod blockdev;
pub mod digest;
pub mod exe;
pub mod files;
pub mod mounts;
pub mod path;
