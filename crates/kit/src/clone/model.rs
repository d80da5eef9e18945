//! Typed snapshot of a domain definition and its storage.
//!
//! Values here are read once from the hypervisor at the start of an
//! operation and are not refreshed afterwards.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use uuid::Uuid;

use crate::xml_utils::XmlNode;

/// Lifecycle state of a domain as reported by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainState {
    /// No state reported
    NoState,
    /// Running
    Running,
    /// Blocked on a resource
    Blocked,
    /// Paused by the user
    Paused,
    /// Being shut down
    Shutdown,
    /// Shut off
    ShutOff,
    /// Crashed
    Crashed,
    /// Suspended by guest power management
    Suspended,
}

impl DomainState {
    /// Parse the state string printed by `virsh domstate`
    pub fn from_virsh(s: &str) -> Self {
        match s.trim() {
            "running" => Self::Running,
            "idle" | "blocked" => Self::Blocked,
            "paused" => Self::Paused,
            "in shutdown" | "shutdown" => Self::Shutdown,
            "shut off" => Self::ShutOff,
            "crashed" => Self::Crashed,
            "pmsuspended" => Self::Suspended,
            _ => Self::NoState,
        }
    }

    /// Stable machine-readable name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoState => "no state",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::ShutOff => "shut-off",
            Self::Crashed => "crashed",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DomainState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// On-disk format of a volume
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VolumeFormat {
    /// Raw image
    Raw,
    /// QEMU copy-on-write v2
    Qcow2,
    /// Anything else libvirt reports (iso, vmdk, dir, ...)
    Other(String),
}

impl VolumeFormat {
    /// Name as used in libvirt XML and `qemu-img`
    pub fn as_str(&self) -> &str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for VolumeFormat {
    fn from(s: &str) -> Self {
        match s {
            "raw" => Self::Raw,
            "qcow2" => Self::Qcow2,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for VolumeFormat {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Reference from a volume to the volume it is layered on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackingStore {
    /// Path of the backing volume
    pub path: Utf8PathBuf,
    /// Format of the backing volume, if recorded
    pub format: Option<VolumeFormat>,
}

/// A storage volume inside a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Pool the volume lives in
    pub pool: String,
    /// Volume name, unique within the pool
    pub name: String,
    /// Globally unique key; for file pools this is the path
    pub key: Option<String>,
    /// Volume type (`file`, `block`, `dir`, ...)
    pub kind: Option<String>,
    /// Absolute path of the volume
    pub path: Utf8PathBuf,
    /// Image format
    pub format: Option<VolumeFormat>,
    /// Logical size in bytes
    pub capacity: Option<u64>,
    /// Bytes actually allocated on the host
    pub allocation: Option<u64>,
    /// Physical size on the host, when libvirt reports it
    pub physical: Option<u64>,
    /// The volume this one is layered on
    pub backing_store: Option<BackingStore>,
}

/// Where a disk's data comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    /// A plain file on the host
    File(Utf8PathBuf),
    /// Any other source (block device, network, pool volume, empty drive)
    Other {
        /// The `type` attribute of the disk
        kind: String,
    },
}

/// One `<disk>` element of a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAttachment {
    /// Guest device name (`vda`, `sdb`, ...)
    pub target: Option<String>,
    /// Device kind (`disk`, `cdrom`, `floppy`, `lun`)
    pub device: String,
    /// Backing source on the host
    pub source: DiskSource,
    /// Format from the driver element
    pub format: Option<VolumeFormat>,
    /// Whether the guest sees the device read-only
    pub read_only: bool,
}

impl StorageAttachment {
    /// Host path to duplicate when cloning, if this attachment gets its own copy.
    ///
    /// Read-only media and anything that is not a plain file, or has no
    /// driver format, are shared with the clone instead.
    pub fn duplication_source(&self) -> Option<&Utf8Path> {
        if self.read_only || self.format.is_none() {
            return None;
        }
        match &self.source {
            DiskSource::File(path) => Some(path),
            DiskSource::Other { .. } => None,
        }
    }

    /// Short human description used in log messages
    pub fn describe(&self) -> String {
        let target = self.target.as_deref().unwrap_or("?");
        match &self.source {
            DiskSource::File(path) => format!("{target} ({path})"),
            DiskSource::Other { kind } => format!("{target} ({kind})"),
        }
    }
}

/// How the firmware store path is written in the domain XML
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwarePathForm {
    /// `<nvram>/path</nvram>`
    Text,
    /// `<nvram type="file"><source file="/path"/></nvram>`
    SourceFile,
}

/// The per-domain UEFI variable store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRef {
    /// Path of the variable store file
    pub path: Utf8PathBuf,
    /// How the path is expressed
    pub form: FirmwarePathForm,
}

/// One `<interface>` element of a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    /// Interface type (`network`, `bridge`, `user`, ...)
    pub kind: String,
    /// MAC address as written in the definition
    pub mac: Option<String>,
    /// Host-side device name assigned by the hypervisor
    pub target: Option<String>,
}

/// Port assignment for a remote display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAllocation {
    /// The hypervisor picks free ports at start
    Auto,
    /// Fixed ports
    Fixed {
        /// Plain port
        port: Option<u16>,
        /// TLS port (SPICE)
        tls_port: Option<u16>,
    },
}

/// One `<graphics>` element of a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsDevice {
    /// Display type (`vnc`, `spice`, `rdp`, `sdl`, ...)
    pub kind: String,
    /// Port assignment; `None` for local displays without ports
    pub ports: Option<PortAllocation>,
    /// WebSocket port; `-1` requests automatic allocation
    pub websocket: Option<i32>,
}

impl GraphicsDevice {
    /// Whether this display type listens on host ports
    pub fn uses_ports(kind: &str) -> bool {
        matches!(kind, "vnc" | "spice" | "rdp")
    }
}

/// A persistent domain definition
///
/// Typed fields are authoritative; the remaining document carries every
/// element the clone workflow does not interpret.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainConfig {
    /// Domain name
    pub name: String,
    /// Domain UUID; `None` lets the hypervisor assign one
    pub uuid: Option<Uuid>,
    /// UEFI variable store, if the domain has a file-backed one
    pub firmware: Option<FirmwareRef>,
    /// Disks in document order
    pub disks: Vec<StorageAttachment>,
    /// Network interfaces in document order
    pub interfaces: Vec<NetworkInterface>,
    /// Graphics devices in document order
    pub graphics: Vec<GraphicsDevice>,
    pub(super) document: XmlNode,
}

/// A defined domain together with its state
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
    /// Lifecycle state at inspection time
    pub state: DomainState,
    /// Persistent configuration
    pub config: DomainConfig,
}

impl Domain {
    /// Domain name
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_state_from_virsh() {
        assert_eq!(DomainState::from_virsh("shut off\n"), DomainState::ShutOff);
        assert_eq!(DomainState::from_virsh("in shutdown"), DomainState::Shutdown);
        assert_eq!(DomainState::from_virsh("pmsuspended"), DomainState::Suspended);
        assert_eq!(DomainState::from_virsh("idle"), DomainState::Blocked);
        assert_eq!(DomainState::from_virsh("whatever"), DomainState::NoState);
        assert_eq!(DomainState::ShutOff.to_string(), "shut-off");
    }

    #[test]
    fn test_volume_format() {
        assert_eq!(VolumeFormat::from("raw"), VolumeFormat::Raw);
        assert_eq!(VolumeFormat::from("qcow2"), VolumeFormat::Qcow2);
        assert_eq!(VolumeFormat::from("iso").as_str(), "iso");
        assert_eq!(
            serde_json::to_string(&VolumeFormat::Qcow2).unwrap(),
            "\"qcow2\""
        );
    }

    fn attachment(source: DiskSource, format: Option<VolumeFormat>, ro: bool) -> StorageAttachment {
        StorageAttachment {
            target: Some("vda".into()),
            device: "disk".into(),
            source,
            format,
            read_only: ro,
        }
    }

    #[test]
    fn test_duplication_source() {
        let file = DiskSource::File("/var/lib/libvirt/images/a.qcow2".into());
        assert_eq!(
            attachment(file.clone(), Some(VolumeFormat::Qcow2), false)
                .duplication_source()
                .map(|p| p.as_str()),
            Some("/var/lib/libvirt/images/a.qcow2")
        );
        assert!(attachment(file.clone(), Some(VolumeFormat::Raw), true)
            .duplication_source()
            .is_none());
        assert!(attachment(file, None, false).duplication_source().is_none());
        assert!(attachment(
            DiskSource::Other {
                kind: "block".into()
            },
            Some(VolumeFormat::Raw),
            false
        )
        .duplication_source()
        .is_none());
    }
}
