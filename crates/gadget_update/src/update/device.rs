//! Default lookup of the block device or mount point backing a structure.
//! Resolution is lazy: the paths are only checked when an updater phase
//! actually needs them.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Error};

use devutils::mounts;

use crate::compat::implicit_filesystem_label;

use super::mounted::MountTarget;

const DISK_BY_PARTLABEL: &str = "/dev/disk/by-partlabel";
const DISK_BY_LABEL: &str = "/dev/disk/by-label";

/// Locates the disk device of a bare structure through its partition label.
pub(super) fn disk_device_for_partition(name: &str) -> Result<PathBuf, Error> {
    ensure!(
        !name.is_empty(),
        "cannot find disk device for an unnamed structure"
    );
    let device = Path::new(DISK_BY_PARTLABEL).join(name);
    ensure!(
        device.exists(),
        "cannot find disk device for structure {name:?}"
    );
    Ok(device)
}

/// Locates the filesystem of a structure through its label (explicit, implied
/// by the role, or the structure name as a fallback). An already mounted
/// filesystem is used in place, otherwise the updater mounts the device
/// itself.
pub(super) fn filesystem_target(
    name: &str,
    label: &str,
    role: &str,
    filesystem: &str,
) -> Result<MountTarget, Error> {
    let label = if !label.is_empty() {
        label
    } else if let Some(implied) = implicit_filesystem_label(role) {
        implied
    } else if !name.is_empty() {
        name
    } else {
        bail!("cannot find the filesystem of an unnamed, unlabeled structure");
    };

    let device = Path::new(DISK_BY_LABEL).join(label);
    ensure!(
        device.exists(),
        "cannot find the filesystem with label {label:?}"
    );
    match mounts::mount_point_of(&device)? {
        Some(mount_point) => Ok(MountTarget::MountPoint(mount_point)),
        None => Ok(MountTarget::Device {
            device,
            filesystem: filesystem.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unnamed_structures_are_rejected() {
        assert_eq!(
            disk_device_for_partition("").unwrap_err().to_string(),
            "cannot find disk device for an unnamed structure"
        );
        assert_eq!(
            filesystem_target("", "", "", "ext4")
                .unwrap_err()
                .to_string(),
            "cannot find the filesystem of an unnamed, unlabeled structure"
        );
    }

    #[test]
    fn test_missing_device_is_reported() {
        let err = disk_device_for_partition("no-such-partition-label")
            .unwrap_err()
            .to_string();
        assert_eq!(
            err,
            r#"cannot find disk device for structure "no-such-partition-label""#
        );
    }
}
