//! Derive the clone's definition from the source's.
//!
//! Everything here is pure: inputs are the source snapshot plus the results
//! of duplication and identity regeneration, output is a new definition.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use super::error::InvariantViolation;
use super::model::{DiskSource, DomainConfig, FirmwareRef, GraphicsDevice, NetworkInterface, Volume};

/// Source path of each duplicated disk mapped to its copy
pub type VolumeMapping = BTreeMap<Utf8PathBuf, Volume>;

fn check_count(what: &'static str, expected: usize, actual: usize) -> Result<(), InvariantViolation> {
    if expected != actual {
        return Err(InvariantViolation::CountMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Build the clone's definition.
///
/// The result has the new name, no UUID (the hypervisor assigns one), every
/// duplicated disk pointing at its copy, the given interfaces and graphics,
/// and the firmware store replaced by `firmware` when the source has one.
/// Disks absent from `volumes` because they are shared keep their source.
pub fn transform(
    original: &DomainConfig,
    new_name: &str,
    volumes: &VolumeMapping,
    firmware: Option<&Volume>,
    interfaces: Vec<NetworkInterface>,
    graphics: Vec<GraphicsDevice>,
) -> Result<DomainConfig, InvariantViolation> {
    check_count("interface", original.interfaces.len(), interfaces.len())?;
    check_count("graphics device", original.graphics.len(), graphics.len())?;
    check_count(
        "firmware store",
        usize::from(original.firmware.is_some()),
        usize::from(firmware.is_some()),
    )?;

    let mut clone = original.clone();
    clone.name = new_name.to_owned();
    clone.uuid = None;

    for disk in clone.disks.iter_mut() {
        let Some(path) = disk.duplication_source().map(ToOwned::to_owned) else {
            continue;
        };
        let volume = volumes
            .get(&path)
            .ok_or(InvariantViolation::MissingVolume(path))?;
        disk.source = DiskSource::File(volume.path.clone());
        if let Some(format) = &volume.format {
            disk.format = Some(format.clone());
        }
    }

    clone.firmware = match (&original.firmware, firmware) {
        (Some(fw), Some(volume)) => Some(FirmwareRef {
            path: volume.path.clone(),
            form: fw.form,
        }),
        _ => None,
    };
    clone.interfaces = interfaces;
    clone.graphics = graphics;

    check_count("disk", original.disks.len(), clone.disks.len())?;
    Ok(clone)
}
