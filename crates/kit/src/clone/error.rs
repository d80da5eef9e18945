//! Failure taxonomy for domain cloning.

use camino::Utf8PathBuf;

use super::hypervisor::HypervisorError;
use super::model::{DomainState, VolumeFormat};
use super::orchestrator::CloneStage;

/// Exit status for failures that indicate a bug rather than bad input
pub const EXIT_INTERNAL_ERROR: i32 = 70;

/// Why a clone request was refused before anything was created
#[derive(Debug, thiserror::Error)]
pub enum PreconditionViolation {
    /// The source domain is not defined
    #[error("domain '{0}' does not exist")]
    SourceNotFound(String),
    /// The source domain must be shut off while its disks are copied
    #[error("domain '{name}' must be shut off to be cloned, current state is {state}")]
    NotShutOff {
        /// Source domain
        name: String,
        /// State it was found in
        state: DomainState,
    },
    /// Another domain already has the requested name
    #[error("domain '{0}' already exists")]
    NameTaken(String),
    /// The requested name cannot be used
    #[error("'{0}' is not a usable domain name")]
    InvalidName(String),
}

/// What a failed duplication was working on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicationSubject {
    /// A disk attachment
    Disk {
        /// Guest device name
        target: Option<String>,
        /// Source path on the host
        path: Utf8PathBuf,
    },
    /// The UEFI variable store
    Firmware {
        /// Source path on the host
        path: Utf8PathBuf,
    },
}

impl std::fmt::Display for DuplicationSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disk {
                target: Some(target),
                path,
            } => write!(f, "disk {target} ({path})"),
            Self::Disk { target: None, path } => write!(f, "disk {path}"),
            Self::Firmware { path } => write!(f, "firmware store {path}"),
        }
    }
}

/// Reasons a single volume could not be duplicated
#[derive(Debug, thiserror::Error)]
pub enum DuplicationError {
    /// The derived destination name is already in use in the pool
    #[error("volume '{name}' already exists in pool '{pool}'")]
    TargetExists {
        /// Pool
        pool: String,
        /// Destination name
        name: String,
    },
    /// Reflink copies need raw source volumes
    #[error("reflink copies require raw volumes, '{volume}' is {format}")]
    ReflinkFormat {
        /// Source volume name
        volume: String,
        /// Its actual format
        format: String,
    },
    /// The storage backend cannot share extents
    #[error("storage does not support reflink copies: {0}")]
    ReflinkUnsupported(String),
    /// The source path is not a volume of any storage pool
    #[error("{0} is not a volume in any storage pool")]
    NotInPool(Utf8PathBuf),
    /// The hypervisor failed the request
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

impl DuplicationError {
    pub(crate) fn reflink_format(volume: &str, format: Option<&VolumeFormat>) -> Self {
        Self::ReflinkFormat {
            volume: volume.to_owned(),
            format: format.map_or("unknown", |f| f.as_str()).to_owned(),
        }
    }
}

/// Duplication of one disk or firmware store failed
#[derive(Debug, thiserror::Error)]
#[error("failed to duplicate {subject} into '{volume}'")]
pub struct DuplicationFailure {
    /// What was being duplicated
    pub subject: DuplicationSubject,
    /// Name of the volume that was to be created
    pub volume: String,
    /// Underlying cause
    #[source]
    pub reason: DuplicationError,
}

/// Internal consistency check failed while assembling the clone
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A MAC address that cannot be split into prefix and suffix
    #[error("'{0}' is not a MAC address of six colon separated octets")]
    InvalidMac(String),
    /// No unused suffix found for a prefix
    #[error("no unused MAC address with prefix {oui} after {attempts} attempts")]
    MacSpaceExhausted {
        /// Preserved vendor prefix
        oui: String,
        /// Number of candidates tried
        attempts: usize,
    },
    /// The clone would not have the same number of devices as its source
    #[error("{what} count mismatch: source has {expected}, clone has {actual}")]
    CountMismatch {
        /// Device class
        what: &'static str,
        /// Count in the source definition
        expected: usize,
        /// Count in the assembled clone
        actual: usize,
    },
    /// A disk that should have been duplicated has no copy
    #[error("no duplicate for disk source {0}")]
    MissingVolume(Utf8PathBuf),
}

/// Error returned by a clone operation
#[derive(Debug, thiserror::Error)]
pub enum CloneError {
    /// Refused before any side effect
    #[error(transparent)]
    Precondition(#[from] PreconditionViolation),
    /// Reading hypervisor state failed
    #[error("failed to inspect {what}")]
    Inspection {
        /// What was being read
        what: String,
        /// Underlying cause
        #[source]
        source: HypervisorError,
    },
    /// A disk or firmware copy failed
    #[error(transparent)]
    Duplication(#[from] DuplicationFailure),
    /// The hypervisor rejected the new definition
    #[error("failed to define domain '{name}'")]
    Registration {
        /// Name of the clone
        name: String,
        /// Underlying cause
        #[source]
        source: HypervisorError,
    },
    /// A bug; nothing the caller did can cause this
    #[error("internal error: {0}")]
    Invariant(#[from] InvariantViolation),
}

impl CloneError {
    pub(crate) fn inspection(what: impl Into<String>, source: HypervisorError) -> Self {
        Self::Inspection {
            what: what.into(),
            source,
        }
    }

    /// Stage that was active when this error was raised
    pub fn stage(&self) -> CloneStage {
        match self {
            Self::Precondition(_) | Self::Inspection { .. } => CloneStage::Validating,
            Self::Duplication(_) => CloneStage::Duplicating,
            Self::Invariant(_) => CloneStage::Assembling,
            Self::Registration { .. } => CloneStage::Registering,
        }
    }

    /// Process exit status a CLI should use for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Invariant(_) => EXIT_INTERNAL_ERROR,
            _ => 1,
        }
    }
}
