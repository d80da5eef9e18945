//! volume-import command - copy a local disk image into a storage pool
//!
//! A volume with the image's format and virtual size is created first, then
//! the file's bytes are streamed into it with `virsh vol-upload`. If the
//! upload fails, the new volume is deleted again.

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{
    eyre::{bail, eyre, Context},
    Result,
};
use tracing::{debug, info, warn};

use super::list_volumes::VolumeDescriptor;
use super::virsh::Virsh;
use super::{print_json, LibvirtOptions};
use crate::clone::hypervisor::Inspector;
use crate::qemu_img;

/// Options for importing a disk image
#[derive(Debug, Parser)]
pub struct VolumeImportOpts {
    /// Path of the disk image to import
    pub file: Utf8PathBuf,

    /// Name of the storage pool to import into
    pub pool: String,

    /// Name of the new volume (defaults to the file name)
    #[clap(long)]
    pub name: Option<String>,
}

impl VolumeImportOpts {
    /// Name the imported volume will get
    pub fn volume_name(&self) -> Result<String> {
        match &self.name {
            Some(name) => Ok(name.clone()),
            None => self
                .file
                .file_name()
                .map(ToOwned::to_owned)
                .ok_or_else(|| eyre!("Cannot derive a volume name from {}", self.file)),
        }
    }
}

/// Create `name` in `pool` and upload the image at `opts.file` into it
pub fn import_volume(virsh: &Virsh, opts: &VolumeImportOpts) -> Result<VolumeDescriptor> {
    let file = &opts.file;
    if !file.is_file() {
        bail!("File {file} does not exist or is not a regular file");
    }
    let pool = opts.pool.as_str();
    if !virsh.pool_exists(pool)? {
        bail!("Storage pool '{pool}' does not exist");
    }
    let name = opts.volume_name()?;
    if virsh.volume(pool, &name)?.is_some() {
        bail!("Volume '{name}' already exists in pool '{pool}'");
    }

    let image = qemu_img::info(file)?;
    debug!(
        "{file}: format {}, virtual size {}",
        image.format, image.virtual_size
    );
    if let Some(ref backing) = image.backing_filename {
        warn!("{file} is layered on {backing}; only the top layer is imported");
    }

    let capacity = image.virtual_size.to_string();
    virsh
        .run([
            "vol-create-as",
            pool,
            name.as_str(),
            capacity.as_str(),
            "--format",
            image.format.as_str(),
        ])
        .with_context(|| format!("Creating volume '{name}' in pool '{pool}'"))?;
    info!("Created volume {name} in pool {pool}");

    let uploaded = virsh.run([
        "vol-upload",
        "--sparse",
        "--pool",
        pool,
        name.as_str(),
        file.as_str(),
    ]);
    if let Err(e) = uploaded {
        match virsh.run(["vol-delete", "--pool", pool, name.as_str()]) {
            Ok(_) => info!("Deleted volume {name} after failed upload"),
            Err(del) => warn!("Failed to delete volume {name} after failed upload: {del}"),
        }
        return Err(e).with_context(|| format!("Uploading {file} into volume '{name}'"));
    }

    let volume = virsh
        .volume(pool, &name)?
        .ok_or_else(|| eyre!("Volume '{name}' vanished after upload"))?;
    Ok(volume.into())
}

/// Execute the volume-import command
pub fn run(global_opts: &LibvirtOptions, opts: VolumeImportOpts) -> Result<()> {
    let volume = import_volume(&global_opts.virsh(), &opts)?;
    print_json(&volume)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(file: &str, name: Option<&str>) -> VolumeImportOpts {
        VolumeImportOpts {
            file: file.into(),
            pool: "default".into(),
            name: name.map(Into::into),
        }
    }

    #[test]
    fn test_volume_name() {
        assert_eq!(
            opts("/tmp/images/fedora.qcow2", None).volume_name().unwrap(),
            "fedora.qcow2"
        );
        assert_eq!(
            opts("/tmp/images/fedora.qcow2", Some("base.qcow2"))
                .volume_name()
                .unwrap(),
            "base.qcow2"
        );
        assert!(opts("/", None).volume_name().is_err());
    }

    #[test]
    fn test_missing_file() {
        let virsh = Virsh::new(Some("test:///default".into()));
        let err = import_volume(&virsh, &opts("/nonexistent/virtmate.img", None)).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
