//! The hypervisor as seen through `virsh`.
//!
//! Every call spawns `virsh` with the configured connection URI. XML
//! documents are parsed with [`crate::clone::domain_xml`].

use std::collections::HashSet;
use std::ffi::OsStr;
use std::io::Write as _;
use std::process::Command;

use camino::Utf8Path;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clone::domain_xml::{parse_domain, parse_volume, render};
use crate::clone::hypervisor::{
    DefinedDomain, HypervisorError, Inspector, Manager, VolumeContent, VolumeSpec,
};
use crate::clone::identity::MacAddr;
use crate::clone::model::{Domain, DomainConfig, DomainState, Volume};
use crate::cmdext::{CommandError, CommandRunExt};
use crate::xml_utils::{parse_xml_dom, XmlNode};

impl From<CommandError> for HypervisorError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Spawn { program, source } => Self::Spawn { program, source },
            CommandError::Failed {
                command, stderr, ..
            } => Self::Command { command, stderr },
            CommandError::InvalidOutput { command, reason } => Self::Malformed {
                what: "command output",
                reason: format!("{command}: {reason}"),
            },
        }
    }
}

/// Whether virsh's error output says the object does not exist
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("not found") || stderr.contains("failed to get")
}

/// Whether a failed reflink clone failed because the storage cannot do it
fn is_reflink_unsupported(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("reflink") || stderr.contains("not supported")
}

fn io_err(context: &'static str) -> impl FnOnce(std::io::Error) -> HypervisorError {
    move |source| HypervisorError::Io {
        context: context.to_owned(),
        source,
    }
}

/// Runs `virsh` against one connection
#[derive(Debug, Clone, Default)]
pub struct Virsh {
    connect: Option<String>,
}

impl Virsh {
    /// Use `connect` as the hypervisor URI, or virsh's default when `None`
    pub fn new(connect: Option<String>) -> Self {
        Self { connect }
    }

    /// Build a virsh command with the connection URI applied
    pub fn command(&self) -> Command {
        let mut cmd = Command::new("virsh");
        if let Some(ref uri) = self.connect {
            cmd.arg("-c").arg(uri);
        }
        cmd
    }

    /// Run virsh and return its standard output
    pub fn run<I, S>(&self, args: I) -> Result<String, HypervisorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Ok(self.command().args(args).run_capture()?)
    }

    /// Run virsh, mapping "no such object" failures to `None`
    fn lookup<I, S>(&self, args: I) -> Result<Option<String>, HypervisorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        match self.command().args(args).run_capture() {
            Ok(out) => Ok(Some(out)),
            Err(CommandError::Failed { stderr, .. }) if is_not_found(&stderr) => {
                debug!("lookup miss: {stderr}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run virsh and parse its output as XML
    pub fn run_xml(&self, args: &[&str]) -> Result<XmlNode, HypervisorError> {
        let out = self.run(args)?;
        parse_xml_dom(&out).map_err(|e| HypervisorError::malformed("XML", format!("{e:#}")))
    }

    /// Names of all defined domains, active or not
    pub fn domain_names(&self) -> Result<Vec<String>, HypervisorError> {
        Ok(non_empty_lines(&self.run(["list", "--all", "--name"])?))
    }

    /// Current lifecycle state of a domain
    pub fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError> {
        Ok(DomainState::from_virsh(&self.run(["domstate", name])?))
    }

    /// UUID of a domain
    pub fn domain_uuid(&self, name: &str) -> Result<Uuid, HypervisorError> {
        let out = self.run(["domuuid", name])?;
        Uuid::parse_str(out.trim())
            .map_err(|e| HypervisorError::malformed("domuuid output", e))
    }

    /// Whether a domain with this name is defined
    pub fn domain_exists(&self, name: &str) -> Result<bool, HypervisorError> {
        Ok(self.lookup(["domuuid", name])?.is_some())
    }

    /// Names of all storage pools, active or not
    pub fn pool_names(&self) -> Result<Vec<String>, HypervisorError> {
        Ok(non_empty_lines(&self.run(["pool-list", "--all", "--name"])?))
    }

    /// Whether a storage pool with this name exists
    pub fn pool_exists(&self, pool: &str) -> Result<bool, HypervisorError> {
        Ok(self.lookup(["pool-info", pool])?.is_some())
    }

    /// Names of the volumes in a pool
    pub fn volume_names(&self, pool: &str) -> Result<Vec<String>, HypervisorError> {
        let out = self.run(["vol-list", "--pool", pool])?;
        Ok(parse_vol_list(&out))
    }
}

fn non_empty_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Volume names from the `virsh vol-list` table
fn parse_vol_list(out: &str) -> Vec<String> {
    out.lines()
        .skip(2) // Skip header lines
        .filter_map(|line| line.split_whitespace().next())
        .map(ToOwned::to_owned)
        .collect()
}

impl Inspector for Virsh {
    fn domain(&self, name: &str) -> Result<Option<Domain>, HypervisorError> {
        let Some(xml) = self.lookup(["dumpxml", "--inactive", name])? else {
            return Ok(None);
        };
        let config = parse_domain(&xml)?;
        let state = self.domain_state(name)?;
        Ok(Some(Domain { state, config }))
    }

    fn volume(&self, pool: &str, name: &str) -> Result<Option<Volume>, HypervisorError> {
        match self.lookup(["vol-dumpxml", "--pool", pool, name])? {
            Some(xml) => Ok(Some(parse_volume(&xml, pool)?)),
            None => Ok(None),
        }
    }

    fn volume_by_path(&self, path: &Utf8Path) -> Result<Option<Volume>, HypervisorError> {
        let Some(pool) = self.lookup(["vol-pool", path.as_str()])? else {
            return Ok(None);
        };
        let pool = pool.trim();
        match self.lookup(["vol-dumpxml", path.as_str()])? {
            Some(xml) => Ok(Some(parse_volume(&xml, pool)?)),
            None => Ok(None),
        }
    }

    fn mac_addresses_in_use(&self) -> Result<HashSet<MacAddr>, HypervisorError> {
        let mut macs = HashSet::new();
        for name in self.domain_names()? {
            // Domains can disappear between listing and dumping
            let Some(xml) = self.lookup(["dumpxml", name.as_str()])? else {
                continue;
            };
            let config = parse_domain(&xml)?;
            for iface in &config.interfaces {
                let Some(mac) = iface.mac.as_deref() else {
                    continue;
                };
                match mac.parse::<MacAddr>() {
                    Ok(mac) => {
                        macs.insert(mac);
                    }
                    Err(e) => warn!("Ignoring MAC address of domain {name}: {e}"),
                }
            }
        }
        Ok(macs)
    }
}

impl Manager for Virsh {
    fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<Volume, HypervisorError> {
        match &spec.content {
            VolumeContent::CopyOf { source, reflink } => {
                let mut args = vec![
                    "vol-clone",
                    "--pool",
                    pool,
                    source.name.as_str(),
                    spec.name.as_str(),
                ];
                if *reflink {
                    args.push("--reflink");
                }
                match self.command().args(&args).run_capture() {
                    Ok(_) => {}
                    Err(CommandError::Failed { stderr, .. })
                        if *reflink && is_reflink_unsupported(&stderr) =>
                    {
                        return Err(HypervisorError::Unsupported(stderr))
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            VolumeContent::BackedBy { source } => {
                let capacity = spec
                    .capacity
                    .or(source.capacity)
                    .ok_or_else(|| {
                        HypervisorError::malformed("volume XML", "backing volume has no capacity")
                    })?
                    .to_string();
                let backing_format = source
                    .format
                    .as_ref()
                    .map(|f| f.as_str())
                    .unwrap_or("raw");
                self.run([
                    "vol-create-as",
                    pool,
                    spec.name.as_str(),
                    capacity.as_str(),
                    "--format",
                    spec.format.as_str(),
                    "--backing-vol",
                    source.path.as_str(),
                    "--backing-vol-format",
                    backing_format,
                ])?;
            }
        }
        created_volume(&spec.name, self.volume(pool, &spec.name), || {
            self.run(["vol-delete", "--pool", pool, spec.name.as_str()])
                .map(drop)
        })
    }

    fn delete_volume(&self, volume: &Volume) -> Result<(), HypervisorError> {
        self.run([
            "vol-delete",
            "--pool",
            volume.pool.as_str(),
            volume.name.as_str(),
        ])?;
        Ok(())
    }

    fn define_domain(&self, config: &DomainConfig) -> Result<DefinedDomain, HypervisorError> {
        let xml = render(config)?;
        let mut file = tempfile::Builder::new()
            .prefix("virtmate-")
            .suffix(".xml")
            .tempfile()
            .map_err(io_err("creating temporary domain XML"))?;
        file.write_all(xml.as_bytes())
            .map_err(io_err("writing temporary domain XML"))?;
        file.flush()
            .map_err(io_err("writing temporary domain XML"))?;
        let path = file.path().to_string_lossy().into_owned();
        self.run(["define", path.as_str()])?;
        let uuid = match self.domain_uuid(&config.name) {
            Ok(uuid) => {
                debug!("Defined domain {} ({})", config.name, uuid);
                Some(uuid)
            }
            Err(e) => {
                warn!("Defined domain {} but could not read its UUID: {e}", config.name);
                None
            }
        };
        Ok(DefinedDomain {
            name: config.name.clone(),
            uuid,
        })
    }

    fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        // The firmware store is a volume of its own and deleted separately
        self.run(["undefine", "--keep-nvram", name])?;
        Ok(())
    }
}

/// Settle the lookup that follows a volume creation.
///
/// If the new volume cannot be described, it is removed again through
/// `remove` and the lookup error is returned.
fn created_volume(
    name: &str,
    lookup: Result<Option<Volume>, HypervisorError>,
    remove: impl FnOnce() -> Result<(), HypervisorError>,
) -> Result<Volume, HypervisorError> {
    let err = match lookup {
        Ok(Some(volume)) => return Ok(volume),
        Ok(None) => HypervisorError::malformed(
            "volume XML",
            format!("volume {name} missing right after creation"),
        ),
        Err(e) => e,
    };
    match remove() {
        Ok(()) => debug!("Removed volume {name} that could not be described"),
        Err(e) => warn!("Failed to remove volume {name} after failed lookup: {e}"),
    }
    Err(err)
}
