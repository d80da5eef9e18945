//! libvirt integration for virtmate
//!
//! Each subcommand lives in its own module:
//! - `domain-list`: List all domains with their state
//! - `domain-clone`: Clone a shut off domain, see [`crate::clone`]
//! - `domain-iface-list`: List network interfaces and addresses of a running domain
//! - `guest-ping`: Check whether the QEMU guest agent responds
//! - `pool-list`: List storage pools
//! - `volume-list`: List volumes of a storage pool
//! - `volume-import`: Copy a local disk image into a storage pool

use clap::ValueEnum;

pub mod clone;
pub mod guest_ping;
pub mod iface_list;
pub mod import;
pub mod list;
pub mod list_pools;
pub mod list_volumes;
pub mod virsh;

/// Global options for libvirt operations
#[derive(Debug, Clone, Default)]
pub struct LibvirtOptions {
    /// Hypervisor connection URI (e.g., qemu:///system, qemu+ssh://host/system)
    pub connect: Option<String>,
}

impl LibvirtOptions {
    /// A virsh runner using the configured connection
    pub fn virsh(&self) -> virsh::Virsh {
        virsh::Virsh::new(self.connect.clone())
    }
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    #[default]
    Json,
    /// Human readable table
    Table,
}

/// Print a value as pretty JSON on stdout
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
