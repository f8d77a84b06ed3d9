//! Updates a bare structure by writing image files to the backing disk device
//! at resolved absolute offsets.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::debug;
use serde::{Deserialize, Serialize};

use devutils::{blockdev, digest, files, path::join_relative};

use crate::layout::PositionedStructure;

use super::{NoUpdate, StructureUpdater};

/// Resolves the disk device carrying the structure, lazily at phase time.
pub type DeviceLookup = dyn Fn() -> Result<PathBuf, Error>;

/// One disk region to be rewritten from an image file.
#[derive(Debug, Clone)]
struct RawRegion {
    image: String,
    /// Absolute offset on the volume.
    offset: u64,
    size: u64,
}

/// What backup captured for one region. Written to the manifest file last, so
/// a readable manifest marks the backup as complete.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawBackupEntry {
    image: String,
    offset: u64,
    size: u64,
    /// Digest of the bytes currently occupying the region.
    digest: String,
    /// Saved region file, or None when the region already carries the new
    /// content and the update can skip it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backup: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawBackupManifest {
    entries: Vec<RawBackupEntry>,
}

const MANIFEST_NAME: &str = "manifest";

pub struct RawStructureUpdater {
    index: usize,
    name: String,
    gadget_root: PathBuf,
    backup_dir: PathBuf,
    regions: Vec<RawRegion>,
    device_lookup: Box<DeviceLookup>,
}

impl std::fmt::Debug for RawStructureUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStructureUpdater")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("gadget_root", &self.gadget_root)
            .field("backup_dir", &self.backup_dir)
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

impl RawStructureUpdater {
    pub fn new(
        ps: &PositionedStructure<'_>,
        gadget_root: &Path,
        rollback_dir: &Path,
        device_lookup: Box<DeviceLookup>,
    ) -> Result<Self, Error> {
        if !ps.is_bare() {
            bail!("internal error: raw updater created for a filesystem structure");
        }
        let regions = ps
            .content
            .iter()
            .map(|content| RawRegion {
                image: content.image.to_owned(),
                offset: content.start_offset.bytes(),
                size: content.size.bytes(),
            })
            .collect();
        Ok(RawStructureUpdater {
            index: ps.index,
            name: ps.name.clone(),
            gadget_root: gadget_root.to_owned(),
            backup_dir: rollback_dir.join(format!("structure-{}", ps.index)),
            regions,
            device_lookup,
        })
    }

    fn manifest_path(&self) -> PathBuf {
        self.backup_dir.join(MANIFEST_NAME)
    }

    fn load_manifest(&self) -> Result<RawBackupManifest, Error> {
        let raw = std::fs::read_to_string(self.manifest_path()).with_context(|| {
            format!(
                "cannot read the backup manifest of structure #{} ({:?})",
                self.index, self.name
            )
        })?;
        serde_yaml::from_str(&raw).context("cannot parse the backup manifest")
    }

    // A manifest whose saved regions are all present marks a complete backup.
    fn backup_is_complete(&self) -> bool {
        let Ok(manifest) = self.load_manifest() else {
            return false;
        };
        manifest.entries.iter().all(|entry| match &entry.backup {
            Some(backup) => self
                .backup_dir
                .join(backup)
                .metadata()
                .map(|m| m.len() == entry.size)
                .unwrap_or(false),
            None => true,
        })
    }

    /// Digest of the image file padded with zeros to the resolved region
    /// size, i.e. of the exact bytes an update would put on disk.
    fn new_content_digest(&self, region: &RawRegion) -> Result<String, Error> {
        let image = join_relative(&self.gadget_root, &region.image);
        let reader = File::open(&image)
            .with_context(|| format!("cannot open image {:?}", region.image))?;
        digest::sha256_reader(reader.chain(std::io::repeat(0)).take(region.size))
    }

    fn backup_file_name(region: &RawRegion) -> String {
        let base = Path::new(&region.image)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| region.image.clone());
        format!("{base}.backup")
    }
}

impl StructureUpdater for RawStructureUpdater {
    fn backup(&mut self) -> Result<(), Error> {
        if self.backup_is_complete() {
            debug!(
                "backup of structure #{} ({:?}) already complete",
                self.index, self.name
            );
            return Ok(());
        }

        let device = (self.device_lookup)()?;
        files::create_dirs(&self.backup_dir)?;

        let mut entries = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            let current = blockdev::read_region(&device, region.offset, region.size)
                .with_context(|| format!("cannot back up the region of {:?}", region.image))?;
            let current_digest = digest::sha256_reader(current.as_slice())?;

            let backup = if current_digest == self.new_content_digest(region)? {
                // The region already carries the new bytes
                debug!(
                    "region of {:?} at offset {} is already up to date",
                    region.image, region.offset
                );
                None
            } else {
                let name = Self::backup_file_name(region);
                files::atomic_write_file(self.backup_dir.join(&name), &current)?;
                Some(name)
            };
            entries.push(RawBackupEntry {
                image: region.image.clone(),
                offset: region.offset,
                size: region.size,
                digest: current_digest,
                backup,
            });
        }

        let manifest = serde_yaml::to_string(&RawBackupManifest { entries })
            .context("cannot serialize the backup manifest")?;
        files::atomic_write_file(self.manifest_path(), manifest.as_bytes())
    }

    fn update(&mut self) -> Result<(), Error> {
        let manifest = self.load_manifest()?;
        if manifest.entries.iter().all(|entry| entry.backup.is_none()) {
            return Err(NoUpdate.into());
        }

        let device = (self.device_lookup)()?;
        for entry in &manifest.entries {
            if entry.backup.is_none() {
                continue;
            }
            debug!(
                "writing {:?} at offset {} ({} bytes)",
                entry.image, entry.offset, entry.size
            );
            blockdev::write_region_from(
                &device,
                entry.offset,
                entry.size,
                join_relative(&self.gadget_root, &entry.image),
            )
            .with_context(|| format!("cannot write image {:?}", entry.image))?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        let manifest = self.load_manifest()?;
        let device = (self.device_lookup)()?;
        for entry in &manifest.entries {
            let Some(backup) = &entry.backup else {
                continue;
            };
            let saved = std::fs::read(self.backup_dir.join(backup))
                .with_context(|| format!("cannot read the saved region of {:?}", entry.image))?;
            debug!(
                "restoring the region of {:?} at offset {} ({} bytes)",
                entry.image,
                entry.offset,
                saved.len()
            );
            blockdev::write_region(&device, entry.offset, &saved)
                .with_context(|| format!("cannot restore the region of {:?}", entry.image))?;
        }
        Ok(())
    }
}
