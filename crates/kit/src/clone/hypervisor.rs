//! Seams between the clone workflow and the virtualization host.
//!
//! [`Inspector`] only reads; [`Manager`] creates and removes things. The
//! workflow only needs something implementing both, see [`Hypervisor`].

use std::collections::HashSet;

use camino::Utf8Path;
use uuid::Uuid;

use super::identity::MacAddr;
use super::model::{Domain, DomainConfig, StorageAttachment, Volume, VolumeFormat};

/// Failure talking to the hypervisor
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    /// The management command could not be started
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },
    /// The management command reported failure
    #[error("{command} failed: {stderr}")]
    Command {
        /// Command line that was run
        command: String,
        /// Captured error output
        stderr: String,
    },
    /// Local I/O needed to fulfil the request failed
    #[error("{context}: {source}")]
    Io {
        /// What was being done
        context: String,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },
    /// The host does not support the requested operation
    #[error("operation not supported: {0}")]
    Unsupported(String),
    /// A document returned by the hypervisor could not be understood
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// Kind of document
        what: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

impl HypervisorError {
    pub(crate) fn malformed(what: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            what,
            reason: reason.to_string(),
        }
    }
}

/// Where a new volume's data comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeContent {
    /// A full copy of another volume in the same pool
    CopyOf {
        /// Volume to copy
        source: Volume,
        /// Share extents with the source instead of copying bytes
        reflink: bool,
    },
    /// A thin overlay whose unwritten blocks read from another volume
    BackedBy {
        /// Backing volume
        source: Volume,
    },
}

/// Request to create one volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// New volume name
    pub name: String,
    /// Format of the new volume
    pub format: VolumeFormat,
    /// Logical size in bytes
    pub capacity: Option<u64>,
    /// Initial content
    pub content: VolumeContent,
}

/// Result of registering a domain definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedDomain {
    /// Domain name
    pub name: String,
    /// UUID the hypervisor assigned
    pub uuid: Option<Uuid>,
}

/// Read access to hypervisor state
pub trait Inspector {
    /// Look up a defined domain by name
    fn domain(&self, name: &str) -> Result<Option<Domain>, HypervisorError>;

    /// Storage attachments of a domain, in definition order
    fn storage_attachments(&self, domain: &Domain) -> Vec<StorageAttachment> {
        domain.config.disks.clone()
    }

    /// Look up a volume by pool and name
    fn volume(&self, pool: &str, name: &str) -> Result<Option<Volume>, HypervisorError>;

    /// Look up the pool volume stored at a host path
    fn volume_by_path(&self, path: &Utf8Path) -> Result<Option<Volume>, HypervisorError>;

    /// MAC addresses used by any domain defined on the host
    fn mac_addresses_in_use(&self) -> Result<HashSet<MacAddr>, HypervisorError>;
}

/// Mutating access to hypervisor state
pub trait Manager {
    /// Create a volume in `pool`
    ///
    /// On error no volume named `spec.name` is left in the pool by this call,
    /// even when the failure happened after the volume was created.
    fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<Volume, HypervisorError>;

    /// Delete a volume
    fn delete_volume(&self, volume: &Volume) -> Result<(), HypervisorError>;

    /// Register a persistent domain definition without starting it
    ///
    /// An error does not guarantee that nothing was defined; callers that
    /// need to know look the domain up again.
    fn define_domain(&self, config: &DomainConfig) -> Result<DefinedDomain, HypervisorError>;

    /// Remove a persistent domain definition, leaving its storage alone
    fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError>;
}

/// Everything the clone workflow needs from a host
pub trait Hypervisor: Inspector + Manager {}

impl<T: Inspector + Manager + ?Sized> Hypervisor for T {}

