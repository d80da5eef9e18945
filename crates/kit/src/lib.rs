//! virtmate: scripting-friendly management of libvirt virtual machines.
//!
//! The heart of the crate is [`clone`], which duplicates a shut off domain
//! together with its disks and firmware store. The [`libvirt`] module holds
//! the `virsh` backed implementation and the command line subcommands.

pub mod clone;
pub mod cmdext;
pub mod config;
pub mod libvirt;
pub mod qemu_img;
pub mod xml_utils;
