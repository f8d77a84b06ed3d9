//! Updates a filesystem structure by syncing content from the gadget root
//! into the mounted filesystem, with per-target backup and tombstones.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context, Error};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use devutils::{archive, exe::RunAndCheck, files, path::join_relative};

use crate::layout::PositionedStructure;

use super::{NoUpdate, StructureUpdater};

/// How to reach the target filesystem: an existing mount point, or a block
/// device the updater mounts itself for the duration of each phase.
#[derive(Debug, Clone)]
pub enum MountTarget {
    MountPoint(PathBuf),
    Device { device: PathBuf, filesystem: String },
}

/// Resolves the target filesystem, lazily at phase time.
pub type MountTargetLookup = dyn Fn() -> Result<MountTarget, Error>;

#[derive(Debug, Clone)]
struct FsContent {
    source: String,
    target: String,
    unpack: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum FsBackupAction {
    /// The previous content was moved into the named entry of the backup
    /// directory.
    Moved { backup: String },
    /// The target did not exist; rollback removes whatever update created.
    Tombstone,
    /// The target is listed in the preserve set and update must skip it.
    Preserved,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FsBackupEntry {
    /// Target path relative to the filesystem root.
    target: String,
    action: FsBackupAction,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FsBackupManifest {
    entries: Vec<FsBackupEntry>,
}

const MANIFEST_NAME: &str = "manifest";

pub struct MountedFilesystemUpdater {
    index: usize,
    name: String,
    gadget_root: PathBuf,
    backup_dir: PathBuf,
    contents: Vec<FsContent>,
    preserve: Vec<String>,
    target_lookup: Box<MountTargetLookup>,
}

impl std::fmt::Debug for MountedFilesystemUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedFilesystemUpdater")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("gadget_root", &self.gadget_root)
            .field("backup_dir", &self.backup_dir)
            .field("contents", &self.contents)
            .field("preserve", &self.preserve)
            .finish_non_exhaustive()
    }
}

// Root of the target filesystem for the duration of one phase: either an
// existing mount point, or a mount this updater performed itself.
enum PhaseRoot {
    Existing(PathBuf),
    SelfMounted(SelfMount),
}

impl PhaseRoot {
    fn path(&self) -> &Path {
        match self {
            PhaseRoot::Existing(path) => path,
            PhaseRoot::SelfMounted(mounted) => mounted.dir.path(),
        }
    }
}

// A device held mounted at a temporary directory, unmounted on drop. Image
// files get a loop device.
struct SelfMount {
    dir: tempfile::TempDir,
}

impl SelfMount {
    fn attach(device: &Path, filesystem: &str) -> Result<Self, Error> {
        let dir = tempfile::tempdir().context("cannot create a temporary mount point")?;
        let mut command = Command::new("mount");
        command.arg("-t").arg(filesystem);
        if device.is_file() {
            command.arg("-o").arg("loop");
        }
        command
            .arg(device)
            .arg(dir.path())
            .run_and_check()
            .with_context(|| {
                format!(
                    "cannot mount {:?} at {:?} as {filesystem}",
                    device,
                    dir.path()
                )
            })?;
        Ok(SelfMount { dir })
    }
}

impl Drop for SelfMount {
    fn drop(&mut self) {
        let unmounted = Command::new("umount").arg(self.dir.path()).run_and_check();
        if let Err(e) = unmounted {
            warn!("cannot unmount {:?}: {e}", self.dir.path());
        }
    }
}

impl MountedFilesystemUpdater {
    pub fn new(
        ps: &PositionedStructure<'_>,
        gadget_root: &Path,
        rollback_dir: &Path,
        target_lookup: Box<MountTargetLookup>,
    ) -> Result<Self, Error> {
        if ps.is_bare() {
            bail!("internal error: filesystem updater created for a bare structure");
        }
        let mut contents = Vec::with_capacity(ps.structure.content.len());
        for entry in &ps.structure.content {
            match entry {
                gadget_api::VolumeContent::Filesystem {
                    source,
                    target,
                    unpack,
                } => contents.push(FsContent {
                    source: source.clone(),
                    target: target.clone(),
                    unpack: *unpack,
                }),
                gadget_api::VolumeContent::RawImage { .. } => {
                    bail!("internal error: raw content in a filesystem structure")
                }
            }
        }
        Ok(MountedFilesystemUpdater {
            index: ps.index,
            name: ps.name.clone(),
            gadget_root: gadget_root.to_owned(),
            backup_dir: rollback_dir.join(format!("structure-{}", ps.index)),
            contents,
            preserve: ps.update.preserve.clone(),
            target_lookup,
        })
    }

    fn mount_root(&self) -> Result<PhaseRoot, Error> {
        match (self.target_lookup)()? {
            MountTarget::MountPoint(path) => Ok(PhaseRoot::Existing(path)),
            MountTarget::Device { device, filesystem } => Ok(PhaseRoot::SelfMounted(
                SelfMount::attach(&device, &filesystem)?,
            )),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.backup_dir.join(MANIFEST_NAME)
    }

    fn load_manifest(&self) -> Result<FsBackupManifest, Error> {
        let raw = std::fs::read_to_string(self.manifest_path()).with_context(|| {
            format!(
                "cannot read the backup manifest of structure #{} ({:?})",
                self.index, self.name
            )
        })?;
        serde_yaml::from_str(&raw).context("cannot parse the backup manifest")
    }

    /// The path update will write for this content entry, relative to the
    /// filesystem root. A file copied to a directory target lands inside it
    /// under its own name.
    fn destination_for(&self, content: &FsContent) -> Result<String, Error> {
        let target = content.target.trim_start_matches('/');
        let target_is_dir = content.target.ends_with('/') || target.is_empty();
        if content.unpack || !target_is_dir {
            return Ok(target.trim_end_matches('/').to_owned());
        }

        let source_path = join_relative(&self.gadget_root, &content.source);
        let metadata = source_path.metadata().with_context(|| {
            format!("cannot inspect content source {:?}", content.source)
        })?;
        if metadata.is_dir() {
            Ok(target.trim_end_matches('/').to_owned())
        } else {
            let base = Path::new(&content.source)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .with_context(|| format!("invalid content source {:?}", content.source))?;
            let target = target.trim_end_matches('/');
            if target.is_empty() {
                Ok(base)
            } else {
                Ok(format!("{target}/{base}"))
            }
        }
    }

    fn is_preserved(&self, relative_target: &str) -> bool {
        self.preserve
            .iter()
            .any(|preserve| preserve.trim_start_matches('/') == relative_target)
    }
}

impl StructureUpdater for MountedFilesystemUpdater {
    fn backup(&mut self) -> Result<(), Error> {
        if self.load_manifest().is_ok() {
            debug!(
                "backup of structure #{} ({:?}) already complete",
                self.index, self.name
            );
            return Ok(());
        }

        let root = self.mount_root()?;
        files::create_dirs(&self.backup_dir)?;

        let mut entries = Vec::with_capacity(self.contents.len());
        for content in &self.contents {
            let relative_target = self.destination_for(content)?;
            let destination = join_relative(root.path(), &relative_target);
            let exists = destination.symlink_metadata().is_ok();

            let action = if exists && self.is_preserved(&relative_target) {
                debug!("target {relative_target:?} is preserved");
                FsBackupAction::Preserved
            } else if exists {
                let backup = escape_path(&relative_target);
                files::move_tree(&destination, self.backup_dir.join(&backup))
                    .with_context(|| format!("cannot back up target {relative_target:?}"))?;
                FsBackupAction::Moved { backup }
            } else {
                FsBackupAction::Tombstone
            };
            entries.push(FsBackupEntry {
                target: relative_target,
                action,
            });
        }

        let manifest = serde_yaml::to_string(&FsBackupManifest { entries })
            .context("cannot serialize the backup manifest")?;
        files::atomic_write_file(self.manifest_path(), manifest.as_bytes())
    }

    fn update(&mut self) -> Result<(), Error> {
        let manifest = self.load_manifest()?;
        let root = self.mount_root()?;

        let mut applied = 0;
        for (content, entry) in self.contents.iter().zip(&manifest.entries) {
            if entry.action == FsBackupAction::Preserved {
                debug!("not updating preserved target {:?}", entry.target);
                continue;
            }
            let source = join_relative(&self.gadget_root, &content.source);
            let destination = join_relative(root.path(), &entry.target);

            if content.unpack {
                archive::unpack_tar(&source, &destination)
                    .with_context(|| format!("cannot unpack {:?}", content.source))?;
            } else if source.is_dir() {
                files::copy_tree(&source, &destination)
                    .with_context(|| format!("cannot write directory {:?}", entry.target))?;
            } else {
                files::atomic_copy_file(&source, &destination)
                    .with_context(|| format!("cannot write {:?}", entry.target))?;
            }
            applied += 1;
        }

        if applied == 0 {
            // Every target was preserved (or there was no content at all)
            return Err(NoUpdate.into());
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        let manifest = self.load_manifest()?;
        let root = self.mount_root()?;

        // Reverse order, so later actions on a shared target unwind first
        for entry in manifest.entries.iter().rev() {
            let destination = join_relative(root.path(), &entry.target);
            match &entry.action {
                FsBackupAction::Moved { backup } => {
                    files::remove_path(&destination)?;
                    files::move_tree(self.backup_dir.join(backup), &destination)
                        .with_context(|| format!("cannot restore target {:?}", entry.target))?;
                }
                FsBackupAction::Tombstone => {
                    files::remove_path(&destination)
                        .with_context(|| format!("cannot remove target {:?}", entry.target))?;
                }
                FsBackupAction::Preserved => {}
            }
        }
        Ok(())
    }
}

// Flattens a relative target path into a single backup entry name.
fn escape_path(path: &str) -> String {
    path.replace('%', "%25").replace('/', "%2F")
}
