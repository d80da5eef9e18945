//! Duplicating volumes for a clone.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::DuplicationError;
use super::hypervisor::{Hypervisor, HypervisorError, VolumeContent, VolumeSpec};
use super::model::{Volume, VolumeFormat};

/// How disk content is carried over to the clone
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CloneMode {
    /// Full, independent copy in the source's format
    #[default]
    Copy,
    /// Thin qcow2 overlay on top of the source volume
    Linked,
    /// Copy sharing extents with the source; raw volumes on a
    /// reflink-capable filesystem only
    Reflink,
}

impl CloneMode {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Linked => "linked",
            Self::Reflink => "reflink",
        }
    }
}

impl std::fmt::Display for CloneMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the volume that holds the clone's copy of `source`
///
/// The clone name is prefixed to the source's file name, so the copy sorts
/// next to the clone's other volumes in the same directory.
pub fn clone_volume_name(clone_name: &str, source: &Utf8Path) -> String {
    let base = source.file_name().unwrap_or(source.as_str());
    format!("{clone_name}-{base}")
}

/// Duplicate `source` into a new volume of the same pool named `target_name`
pub fn duplicate<H: Hypervisor + ?Sized>(
    hv: &H,
    source: &Volume,
    target_name: &str,
    mode: CloneMode,
) -> Result<Volume, DuplicationError> {
    if hv.volume(&source.pool, target_name)?.is_some() {
        return Err(DuplicationError::TargetExists {
            pool: source.pool.clone(),
            name: target_name.to_owned(),
        });
    }

    let spec = match mode {
        CloneMode::Copy => VolumeSpec {
            name: target_name.to_owned(),
            format: source_format(source),
            capacity: source.capacity,
            content: VolumeContent::CopyOf {
                source: source.clone(),
                reflink: false,
            },
        },
        CloneMode::Reflink => {
            if source.format != Some(VolumeFormat::Raw) {
                return Err(DuplicationError::reflink_format(
                    &source.name,
                    source.format.as_ref(),
                ));
            }
            VolumeSpec {
                name: target_name.to_owned(),
                format: VolumeFormat::Raw,
                capacity: source.capacity,
                content: VolumeContent::CopyOf {
                    source: source.clone(),
                    reflink: true,
                },
            }
        }
        CloneMode::Linked => VolumeSpec {
            name: target_name.to_owned(),
            format: VolumeFormat::Qcow2,
            capacity: source.capacity,
            content: VolumeContent::BackedBy {
                source: source.clone(),
            },
        },
    };

    debug!(
        "Creating {} volume {} in pool {} from {}",
        mode, target_name, source.pool, source.path
    );
    let created = match hv.create_volume(&source.pool, &spec) {
        Ok(v) => v,
        Err(HypervisorError::Unsupported(msg)) if mode == CloneMode::Reflink => {
            return Err(DuplicationError::ReflinkUnsupported(msg))
        }
        Err(e) => return Err(e.into()),
    };
    info!("Created volume {} ({})", created.name, created.path);
    Ok(created)
}

/// Duplicate a firmware variable store.
///
/// The store is small and written by the guest firmware itself, so it is
/// always fully copied regardless of how disks are cloned.
pub fn duplicate_firmware<H: Hypervisor + ?Sized>(
    hv: &H,
    source: &Volume,
    target_name: &str,
) -> Result<Volume, DuplicationError> {
    duplicate(hv, source, target_name, CloneMode::Copy)
}

fn source_format(source: &Volume) -> VolumeFormat {
    source.format.clone().unwrap_or(VolumeFormat::Raw)
}
