//! The update orchestrator: drives layout, compatibility checking, updater
//! selection and the backup/update/rollback transaction.

pub mod mounted;
pub mod raw;

mod device;

use std::path::{Path, PathBuf};

use anyhow::ensure;
use log::{debug, warn};

use gadget_api::GadgetInfo;

use crate::{
    compat::{self, StructureChangeError, VolumeChangeError},
    layout::{position_volume, LayoutError, PositionedStructure},
};

pub use mounted::{MountTarget, MountedFilesystemUpdater};
pub use raw::RawStructureUpdater;

/// A gadget description paired with the directory holding its content files.
#[derive(Debug, Clone)]
pub struct GadgetData {
    pub info: GadgetInfo,
    pub root_dir: PathBuf,
}

/// Sentinel for "there is nothing to do": either no structure carried a newer
/// edition, or an updater found the target already up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("nothing to update")]
pub struct NoUpdate;

/// The per-structure update strategy contract.
///
/// `backup` captures enough state under the rollback directory to restore the
/// structure, and is idempotent within one transaction. `update` applies the
/// new content, returning a [`NoUpdate`] error when inspection shows no work
/// is needed. `rollback` restores the captured state and tolerates being
/// called after a backup alone or after a partial update.
pub trait StructureUpdater: std::fmt::Debug {
    fn backup(&mut self) -> Result<(), anyhow::Error>;
    fn update(&mut self) -> Result<(), anyhow::Error>;
    fn rollback(&mut self) -> Result<(), anyhow::Error>;
}

/// Capability used to report rollback problems that must not displace the
/// primary failure.
pub trait Logger {
    fn notice(&self, message: &str);
}

struct WarnLogger;

impl Logger for WarnLogger {
    fn notice(&self, message: &str) {
        warn!("{message}");
    }
}

/// Selects the update strategy for a structure.
pub type UpdaterFactory<'a> = dyn Fn(&PositionedStructure<'_>, &Path, &Path) -> Result<Box<dyn StructureUpdater>, anyhow::Error>
    + 'a;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("cannot lay out the old volume: {0}")]
    OldLayout(LayoutError),

    #[error("cannot lay out the new volume: {0}")]
    NewLayout(LayoutError),

    #[error("cannot find entry for volume {name:?} in updated gadget info")]
    MissingVolume { name: String },

    #[error("cannot update with more than one volume")]
    MultipleVolumes,

    #[error("cannot apply update to volume: {0}")]
    IncompatibleVolume(#[from] VolumeChangeError),

    #[error("cannot update volume structure #{index} ({name:?}): {cause}")]
    IncompatibleStructure {
        index: usize,
        name: String,
        cause: StructureChangeError,
    },

    #[error("cannot prepare update for volume structure #{index} ({name:?}): {cause}")]
    Prepare {
        index: usize,
        name: String,
        cause: anyhow::Error,
    },

    #[error("cannot backup volume structure #{index} ({name:?}): {cause}")]
    Backup {
        index: usize,
        name: String,
        cause: anyhow::Error,
    },

    #[error("cannot update volume structure #{index} ({name:?}): {cause}")]
    Apply {
        index: usize,
        name: String,
        cause: anyhow::Error,
    },

    #[error("nothing to update")]
    NoUpdate,
}

impl UpdateError {
    /// True for the "no structure needed an update" outcome, which callers
    /// usually treat as success.
    pub fn is_no_update(&self) -> bool {
        matches!(self, UpdateError::NoUpdate)
    }
}

/// The transaction manager for one gadget transition.
///
/// The updater factory and the rollback logger are capabilities supplied at
/// construction so tests can stub them; [`update`] wraps the defaults.
pub struct UpdateRunner<'a> {
    factory: Box<UpdaterFactory<'a>>,
    logger: Box<dyn Logger + 'a>,
}

impl UpdateRunner<'static> {
    pub fn new() -> Self {
        UpdateRunner {
            factory: Box::new(updater_for_structure),
            logger: Box::new(WarnLogger),
        }
    }
}

impl Default for UpdateRunner<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> UpdateRunner<'a> {
    pub fn with_factory(self, factory: Box<UpdaterFactory<'a>>) -> UpdateRunner<'a> {
        UpdateRunner {
            factory,
            logger: self.logger,
        }
    }

    pub fn with_logger(self, logger: Box<dyn Logger + 'a>) -> UpdateRunner<'a> {
        UpdateRunner {
            factory: self.factory,
            logger,
        }
    }

    /// Applies the transition from the old gadget data to the new one.
    ///
    /// Volumes are laid out and checked for compatibility; every structure
    /// whose new edition is strictly greater than the old is backed up and
    /// then updated, in structure index order. The first update failure rolls
    /// back every structure updated so far (in order) and is returned as the
    /// primary error; rollback failures are only reported through the logger.
    pub fn run(
        &self,
        old: &GadgetData,
        new: &GadgetData,
        rollback_dir: &Path,
    ) -> Result<(), UpdateError> {
        let mut volumes = old.info.volumes.iter();
        let (volume_name, old_volume) = match (volumes.next(), volumes.next()) {
            (Some(entry), None) => entry,
            _ => return Err(UpdateError::MultipleVolumes),
        };
        let new_volume =
            new.info
                .volumes
                .get(volume_name)
                .ok_or_else(|| UpdateError::MissingVolume {
                    name: volume_name.clone(),
                })?;

        let old_positioned =
            position_volume(&old.root_dir, old_volume).map_err(UpdateError::OldLayout)?;
        let new_positioned =
            position_volume(&new.root_dir, new_volume).map_err(UpdateError::NewLayout)?;

        compat::can_update_volume(&old_positioned, &new_positioned)?;

        // Pair structures by index and keep the ones opting into the update
        let mut updates = Vec::new();
        for (from, to) in old_positioned
            .structures
            .iter()
            .zip(new_positioned.structures.iter())
        {
            compat::can_update_structure(from, to).map_err(|cause| {
                UpdateError::IncompatibleStructure {
                    index: to.index,
                    name: to.name.clone(),
                    cause,
                }
            })?;
            if to.update.edition > from.update.edition {
                updates.push(to);
            } else {
                debug!(
                    "skipping structure #{} ({:?}), new edition {} does not exceed the old edition {}",
                    to.index, to.name, to.update.edition, from.update.edition
                );
            }
        }
        if updates.is_empty() {
            return Err(UpdateError::NoUpdate);
        }

        let mut updaters = Vec::with_capacity(updates.len());
        for ps in &updates {
            let updater = (self.factory)(ps, &new.root_dir, rollback_dir).map_err(|cause| {
                UpdateError::Prepare {
                    index: ps.index,
                    name: ps.name.clone(),
                    cause,
                }
            })?;
            updaters.push(updater);
        }

        // Every backup completes before the first write is attempted
        for (updater, ps) in updaters.iter_mut().zip(&updates) {
            debug!("backing up structure #{} ({:?})", ps.index, ps.name);
            updater.backup().map_err(|cause| UpdateError::Backup {
                index: ps.index,
                name: ps.name.clone(),
                cause,
            })?;
        }

        let mut failure = None;
        for (position, (updater, ps)) in updaters.iter_mut().zip(&updates).enumerate() {
            debug!("updating structure #{} ({:?})", ps.index, ps.name);
            match updater.update() {
                Ok(()) => {}
                Err(cause) if cause.is::<NoUpdate>() => {
                    debug!("nothing to update for structure #{} ({:?})", ps.index, ps.name);
                }
                Err(cause) => {
                    failure = Some((
                        position,
                        UpdateError::Apply {
                            index: ps.index,
                            name: ps.name.clone(),
                            cause,
                        },
                    ));
                    break;
                }
            }
        }

        let Some((last_attempted, primary)) = failure else {
            return Ok(());
        };

        self.logger.notice(&format!("cannot update gadget: {primary}"));
        // Restore every structure touched so far, in order; a rollback
        // failure is reported but never displaces the primary cause
        for (updater, ps) in updaters[..=last_attempted].iter_mut().zip(&updates) {
            if let Err(err) = updater.rollback() {
                self.logger.notice(&format!(
                    "cannot rollback volume structure #{} ({:?}) update: {}",
                    ps.index, ps.name, err
                ));
            }
        }
        Err(primary)
    }
}

/// Applies the transition with the default updater factory and logger.
pub fn update(
    old: &GadgetData,
    new: &GadgetData,
    rollback_dir: &Path,
) -> Result<(), UpdateError> {
    UpdateRunner::new().run(old, new, rollback_dir)
}

/// The default updater selection: bare structures are written as raw images
/// to the backing disk device, filesystem structures are synced through their
/// mount point.
pub fn updater_for_structure(
    ps: &PositionedStructure<'_>,
    gadget_root: &Path,
    rollback_dir: &Path,
) -> Result<Box<dyn StructureUpdater>, anyhow::Error> {
    ensure!(
        !rollback_dir.as_os_str().is_empty(),
        "internal error: backup directory cannot be unset"
    );
    ensure!(
        !gadget_root.as_os_str().is_empty(),
        "internal error: gadget content directory cannot be unset"
    );

    if ps.is_bare() {
        let name = ps.name.clone();
        Ok(Box::new(RawStructureUpdater::new(
            ps,
            gadget_root,
            rollback_dir,
            Box::new(move || device::disk_device_for_partition(&name)),
        )?))
    } else {
        let (name, label, role, filesystem) = (
            ps.name.clone(),
            ps.label.clone(),
            ps.effective_role().to_owned(),
            ps.filesystem.clone(),
        );
        Ok(Box::new(MountedFilesystemUpdater::new(
            ps,
            gadget_root,
            rollback_dir,
            Box::new(move || device::filesystem_target(&name, &label, &role, &filesystem)),
        )?))
    }
}
