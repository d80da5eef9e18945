//! Domain cloning.
//!
//! A clone is a new, shut off domain with its own copies of the source's
//! writable disks and firmware store, fresh MAC addresses and automatically
//! allocated display ports. Read-only media and non-file storage are shared.
//!
//! The workflow in [`orchestrator`] only talks to the host through the
//! traits in [`hypervisor`]; [`crate::libvirt::virsh`] provides the real
//! implementation.

pub mod domain_xml;
pub mod error;
pub mod hypervisor;
pub mod identity;
pub mod model;
pub mod orchestrator;
pub mod storage;
pub mod transform;

#[cfg(test)]
pub(crate) mod testing;

pub use error::CloneError;
pub use orchestrator::{clone_domain, CloneOutcome, CloneRequest, CloneStage};
pub use storage::CloneMode;
