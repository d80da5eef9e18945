//! volume-list command - list the volumes of a storage pool

use clap::Parser;
use color_eyre::{
    eyre::{bail, Context},
    Result,
};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::BinaryBytes;
use serde::Serialize;

use super::virsh::Virsh;
use super::{print_json, LibvirtOptions, OutputFormat};
use crate::clone::hypervisor::Inspector;
use crate::clone::model::{BackingStore, Volume};

/// Options for listing the volumes of a pool
#[derive(Debug, Parser)]
pub struct VolumeListOpts {
    /// Name of the storage pool
    pub pool: String,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
}

/// Where a volume is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDescriptor {
    /// Path on the host
    pub path: String,
    /// Image format
    pub format_type: Option<String>,
}

/// The volume another volume is layered on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackingStoreDescriptor {
    /// Path of the backing volume
    pub path: Option<String>,
    /// Format of the backing volume
    pub format_type: Option<String>,
}

/// One entry of `volume-list` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeDescriptor {
    /// Volume name
    pub name: String,
    /// Unique key of the volume
    pub key: Option<String>,
    /// Logical size in bytes
    pub capacity: Option<u64>,
    /// Bytes allocated on the host
    pub allocation: Option<u64>,
    /// Physical size on the host
    pub physical: Option<u64>,
    /// Volume type (`file`, `block`, ...)
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Storage location
    pub target: TargetDescriptor,
    /// Backing volume, for layered images
    pub backing_store: Option<BackingStoreDescriptor>,
}

impl From<&BackingStore> for BackingStoreDescriptor {
    fn from(b: &BackingStore) -> Self {
        Self {
            path: Some(b.path.to_string()),
            format_type: b.format.as_ref().map(|f| f.to_string()),
        }
    }
}

impl From<Volume> for VolumeDescriptor {
    fn from(v: Volume) -> Self {
        Self {
            backing_store: v.backing_store.as_ref().map(Into::into),
            target: TargetDescriptor {
                path: v.path.into_string(),
                format_type: v.format.map(|f| f.to_string()),
            },
            name: v.name,
            key: v.key,
            capacity: v.capacity,
            allocation: v.allocation,
            physical: v.physical,
            kind: v.kind,
        }
    }
}

/// Describe every volume of `pool`, sorted by name
pub fn list_volumes(virsh: &Virsh, pool: &str) -> Result<Vec<VolumeDescriptor>> {
    if !virsh.pool_exists(pool)? {
        bail!("Storage pool '{pool}' does not exist");
    }
    let mut volumes = Vec::new();
    for name in virsh
        .volume_names(pool)
        .with_context(|| format!("Listing volumes of pool '{pool}'"))?
    {
        let volume = virsh
            .volume(pool, &name)
            .with_context(|| format!("Reading volume '{name}' of pool '{pool}'"))?;
        // Volumes can be deleted between listing and lookup
        if let Some(volume) = volume {
            volumes.push(VolumeDescriptor::from(volume));
        }
    }
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(volumes)
}

fn size_cell(size: Option<u64>) -> String {
    size.map(|s| BinaryBytes(s).to_string())
        .unwrap_or_else(|| "-".to_owned())
}

/// Execute the volume-list command
pub fn run(global_opts: &LibvirtOptions, opts: VolumeListOpts) -> Result<()> {
    let volumes = list_volumes(&global_opts.virsh(), &opts.pool)?;
    match opts.format {
        OutputFormat::Json => print_json(&volumes)?,
        OutputFormat::Table => {
            if volumes.is_empty() {
                println!("No volumes found in pool '{}'", opts.pool);
                return Ok(());
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["NAME", "FORMAT", "CAPACITY", "ALLOCATION", "BACKING"]);
            for v in &volumes {
                table.add_row(vec![
                    v.name.clone(),
                    v.target.format_type.clone().unwrap_or_else(|| "-".into()),
                    size_cell(v.capacity),
                    size_cell(v.allocation),
                    v.backing_store
                        .as_ref()
                        .and_then(|b| b.path.clone())
                        .unwrap_or_default(),
                ]);
            }
            println!("{}", table);
        }
    }
    Ok(())
}
