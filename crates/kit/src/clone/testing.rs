//! In-memory hypervisor used by unit tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use indoc::indoc;
use uuid::Uuid;

use super::domain_xml;
use super::hypervisor::{
    DefinedDomain, HypervisorError, Inspector, Manager, VolumeContent, VolumeSpec,
};
use super::identity::MacAddr;
use super::model::{BackingStore, Domain, DomainConfig, DomainState, Volume, VolumeFormat};

pub(crate) const WEB_DOMAIN_XML: &str = indoc! { r#"
    <domain type="kvm">
      <name>web</name>
      <uuid>c7a5fdbd-edaf-9455-926a-d65c16db1809</uuid>
      <memory unit="KiB">2097152</memory>
      <vcpu placement="static">2</vcpu>
      <os>
        <type arch="x86_64" machine="q35">hvm</type>
        <loader readonly="yes" type="pflash">/usr/share/OVMF/OVMF_CODE.fd</loader>
        <nvram>/var/lib/libvirt/qemu/nvram/web_VARS.fd</nvram>
      </os>
      <devices>
        <emulator>/usr/bin/qemu-system-x86_64</emulator>
        <disk type="file" device="disk">
          <driver name="qemu" type="qcow2"/>
          <source file="/var/lib/libvirt/images/web.qcow2"/>
          <backingStore/>
          <target dev="vda" bus="virtio"/>
        </disk>
        <disk type="file" device="disk">
          <driver name="qemu" type="raw"/>
          <source file="/var/lib/libvirt/images/web-data.img"/>
          <target dev="vdb" bus="virtio"/>
        </disk>
        <disk type="file" device="cdrom">
          <driver name="qemu" type="raw"/>
          <source file="/var/lib/libvirt/images/install.iso"/>
          <target dev="sda" bus="sata"/>
          <readonly/>
        </disk>
        <disk type="block" device="disk">
          <driver name="qemu" type="raw"/>
          <source dev="/dev/vg0/shared"/>
          <target dev="vdc" bus="virtio"/>
        </disk>
        <interface type="network">
          <mac address="52:54:00:6b:3c:58"/>
          <source network="default"/>
          <target dev="vnet0"/>
          <model type="virtio"/>
        </interface>
        <interface type="bridge">
          <mac address="52:54:00:12:34:56"/>
          <source bridge="br0"/>
          <model type="virtio"/>
        </interface>
        <graphics type="vnc" port="5901" autoport="no" websocket="5701" listen="127.0.0.1">
          <listen type="address" address="127.0.0.1"/>
        </graphics>
        <graphics type="spice" port="5902" tlsPort="5903" autoport="no"/>
        <graphics type="sdl" display=":0"/>
      </devices>
    </domain>
"# };

const OTHER_DOMAIN_XML: &str = indoc! { r#"
    <domain type="kvm">
      <name>other</name>
      <devices>
        <interface type="network">
          <mac address="52:54:00:aa:bb:cc"/>
          <source network="default"/>
        </interface>
      </devices>
    </domain>
"# };

/// `web` (shut off) with two writable disks, a cdrom, a block device and a
/// firmware store, plus an unrelated domain `other`
pub(crate) fn web_fixture() -> MemoryHypervisor {
    let hv = MemoryHypervisor::new();
    hv.add_volume("default", "web.qcow2", VolumeFormat::Qcow2, b"root-disk");
    hv.add_volume("default", "web-data.img", VolumeFormat::Raw, b"data");
    hv.add_volume("default", "install.iso", VolumeFormat::Raw, b"iso");
    hv.add_volume("nvram", "web_VARS.fd", VolumeFormat::Raw, b"vars");
    hv.add_domain(WEB_DOMAIN_XML, DomainState::ShutOff);
    hv.add_domain(OTHER_DOMAIN_XML, DomainState::Running);
    hv
}

/// `web` (shut off) with five writable qcow2 disks and no firmware store
pub(crate) fn multi_disk_fixture() -> MemoryHypervisor {
    let hv = MemoryHypervisor::new();
    let mut disks = String::new();
    for i in 1..=5 {
        let name = format!("disk{i}.qcow2");
        hv.add_volume("default", &name, VolumeFormat::Qcow2, name.as_bytes());
        disks.push_str(&format!(
            r#"<disk type="file" device="disk"><driver name="qemu" type="qcow2"/><source file="/var/lib/libvirt/images/{name}"/><target dev="vd{}"/></disk>"#,
            char::from(b'a' + i as u8 - 1)
        ));
    }
    let xml = format!(
        r#"<domain type="kvm"><name>web</name><devices>{disks}<interface type="network"><mac address="52:54:00:01:02:03"/></interface></devices></domain>"#
    );
    hv.add_domain(&xml, DomainState::ShutOff);
    hv
}

#[derive(Debug)]
struct StoredVolume {
    volume: Volume,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    pools: BTreeMap<String, Utf8PathBuf>,
    domains: BTreeMap<String, Domain>,
    volumes: BTreeMap<(String, String), StoredVolume>,
    creations: usize,
    fail_creation_at: Option<usize>,
    fail_after_creation_at: Option<usize>,
    fail_define: bool,
    fail_after_define: bool,
    undeletable: HashSet<String>,
    deletions: Vec<String>,
    reflink_supported: bool,
}

/// A hypervisor that keeps domains and volume bytes in memory
#[derive(Debug)]
pub(crate) struct MemoryHypervisor {
    state: RefCell<State>,
}

fn command_error(command: &str, stderr: impl Into<String>) -> HypervisorError {
    HypervisorError::Command {
        command: command.to_owned(),
        stderr: stderr.into(),
    }
}

impl MemoryHypervisor {
    /// Two pools: `default` for disk images and `nvram` for firmware stores
    pub(crate) fn new() -> Self {
        let mut state = State::default();
        state
            .pools
            .insert("default".into(), "/var/lib/libvirt/images".into());
        state
            .pools
            .insert("nvram".into(), "/var/lib/libvirt/qemu/nvram".into());
        Self {
            state: RefCell::new(state),
        }
    }

    pub(crate) fn add_volume(
        &self,
        pool: &str,
        name: &str,
        format: VolumeFormat,
        content: &[u8],
    ) -> Volume {
        let mut state = self.state.borrow_mut();
        let path = state.pools[pool].join(name);
        let volume = Volume {
            pool: pool.to_owned(),
            name: name.to_owned(),
            key: Some(path.to_string()),
            kind: Some("file".into()),
            path,
            format: Some(format),
            capacity: Some(content.len() as u64),
            allocation: Some(content.len() as u64),
            physical: None,
            backing_store: None,
        };
        state.volumes.insert(
            (pool.to_owned(), name.to_owned()),
            StoredVolume {
                volume: volume.clone(),
                content: content.to_vec(),
            },
        );
        volume
    }

    pub(crate) fn add_domain(&self, xml: &str, state: DomainState) {
        let config = domain_xml::parse_domain(xml).unwrap();
        self.state
            .borrow_mut()
            .domains
            .insert(config.name.clone(), Domain { state, config });
    }

    pub(crate) fn set_state(&self, name: &str, state: DomainState) {
        self.state
            .borrow_mut()
            .domains
            .get_mut(name)
            .unwrap()
            .state = state;
    }

    /// Make the `n`-th volume creation (counting from 1) fail
    pub(crate) fn fail_creation_at(&self, n: usize) {
        self.state.borrow_mut().fail_creation_at = Some(n);
    }

    /// Make the `n`-th volume creation create the volume and then fail,
    /// removing it again the way [`Manager::create_volume`] promises
    pub(crate) fn fail_after_creation_at(&self, n: usize) {
        self.state.borrow_mut().fail_after_creation_at = Some(n);
    }

    pub(crate) fn fail_define(&self) {
        self.state.borrow_mut().fail_define = true;
    }

    /// Make the next define register the domain and then report failure
    pub(crate) fn fail_after_define(&self) {
        self.state.borrow_mut().fail_after_define = true;
    }

    pub(crate) fn fail_deletion_of(&self, name: &str) {
        self.state.borrow_mut().undeletable.insert(name.to_owned());
    }

    pub(crate) fn set_reflink_supported(&self, supported: bool) {
        self.state.borrow_mut().reflink_supported = supported;
    }

    /// Number of volume creations attempted so far
    pub(crate) fn creations(&self) -> usize {
        self.state.borrow().creations
    }

    /// Names of deleted volumes in deletion order
    pub(crate) fn deletions(&self) -> Vec<String> {
        self.state.borrow().deletions.clone()
    }

    /// Sorted names of all volumes in all pools
    pub(crate) fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .borrow()
            .volumes
            .keys()
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Bytes a reader of the volume would see, following backing stores
    pub(crate) fn read_volume(&self, pool: &str, name: &str) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let mut current = state.volumes.get(&(pool.to_owned(), name.to_owned()))?;
        loop {
            match &current.volume.backing_store {
                Some(backing) if current.content.is_empty() => {
                    current = state
                        .volumes
                        .values()
                        .find(|v| v.volume.path == backing.path)?;
                }
                _ => return Some(current.content.clone()),
            }
        }
    }
}

impl Inspector for MemoryHypervisor {
    fn domain(&self, name: &str) -> Result<Option<Domain>, HypervisorError> {
        Ok(self.state.borrow().domains.get(name).cloned())
    }

    fn volume(&self, pool: &str, name: &str) -> Result<Option<Volume>, HypervisorError> {
        let state = self.state.borrow();
        if !state.pools.contains_key(pool) {
            return Err(command_error("vol-dumpxml", format!("no pool {pool}")));
        }
        Ok(state
            .volumes
            .get(&(pool.to_owned(), name.to_owned()))
            .map(|v| v.volume.clone()))
    }

    fn volume_by_path(&self, path: &Utf8Path) -> Result<Option<Volume>, HypervisorError> {
        Ok(self
            .state
            .borrow()
            .volumes
            .values()
            .find(|v| v.volume.path == path)
            .map(|v| v.volume.clone()))
    }

    fn mac_addresses_in_use(&self) -> Result<HashSet<MacAddr>, HypervisorError> {
        Ok(self
            .state
            .borrow()
            .domains
            .values()
            .flat_map(|d| d.config.interfaces.iter())
            .filter_map(|i| i.mac.as_deref()?.parse().ok())
            .collect())
    }
}

impl Manager for MemoryHypervisor {
    fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<Volume, HypervisorError> {
        let mut state = self.state.borrow_mut();
        state.creations += 1;
        if state.fail_creation_at == Some(state.creations) {
            return Err(command_error("vol-create", "injected failure"));
        }
        let dir = state
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| command_error("vol-create", format!("no pool {pool}")))?;
        let key = (pool.to_owned(), spec.name.clone());
        if state.volumes.contains_key(&key) {
            return Err(command_error("vol-create", "volume exists"));
        }

        let (content, backing_store) = match &spec.content {
            VolumeContent::CopyOf { reflink: true, .. } if !state.reflink_supported => {
                return Err(HypervisorError::Unsupported(
                    "reflink is not supported".into(),
                ))
            }
            VolumeContent::CopyOf { source, .. } => {
                let src = state
                    .volumes
                    .get(&(source.pool.clone(), source.name.clone()))
                    .ok_or_else(|| command_error("vol-clone", "source vanished"))?;
                (src.content.clone(), None)
            }
            VolumeContent::BackedBy { source } => (
                Vec::new(),
                Some(BackingStore {
                    path: source.path.clone(),
                    format: source.format.clone(),
                }),
            ),
        };
        let path = dir.join(&spec.name);
        let volume = Volume {
            pool: pool.to_owned(),
            name: spec.name.clone(),
            key: Some(path.to_string()),
            kind: Some("file".into()),
            path,
            format: Some(spec.format.clone()),
            capacity: spec.capacity,
            allocation: Some(content.len() as u64),
            physical: None,
            backing_store,
        };
        state.volumes.insert(
            key.clone(),
            StoredVolume {
                volume: volume.clone(),
                content,
            },
        );
        if state.fail_after_creation_at == Some(state.creations) {
            state.volumes.remove(&key);
            state.deletions.push(spec.name.clone());
            return Err(command_error("vol-dumpxml", "injected failure"));
        }
        Ok(volume)
    }

    fn delete_volume(&self, volume: &Volume) -> Result<(), HypervisorError> {
        let mut state = self.state.borrow_mut();
        if state.undeletable.contains(&volume.name) {
            return Err(command_error("vol-delete", "injected failure"));
        }
        state
            .volumes
            .remove(&(volume.pool.clone(), volume.name.clone()))
            .ok_or_else(|| command_error("vol-delete", "no such volume"))?;
        state.deletions.push(volume.name.clone());
        Ok(())
    }

    fn define_domain(&self, config: &DomainConfig) -> Result<DefinedDomain, HypervisorError> {
        let mut state = self.state.borrow_mut();
        if state.fail_define {
            return Err(command_error("define", "injected failure"));
        }
        if state.domains.contains_key(&config.name) {
            return Err(command_error("define", "domain exists"));
        }
        // Go through XML like a real host would
        let mut parsed = domain_xml::parse_domain(&domain_xml::render(config)?)?;
        let uuid = parsed.uuid.unwrap_or_else(Uuid::new_v4);
        parsed.uuid = Some(uuid);
        let name = parsed.name.clone();
        state.domains.insert(
            name.clone(),
            Domain {
                state: DomainState::ShutOff,
                config: parsed,
            },
        );
        if std::mem::take(&mut state.fail_after_define) {
            return Err(command_error("domuuid", "injected failure"));
        }
        Ok(DefinedDomain {
            name,
            uuid: Some(uuid),
        })
    }

    fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.state
            .borrow_mut()
            .domains
            .remove(name)
            .map(drop)
            .ok_or_else(|| command_error("undefine", format!("no domain {name}")))
    }
}
