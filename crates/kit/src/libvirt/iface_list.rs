//! domain-iface-list command - network interfaces of a running domain
//!
//! Addresses come from `virsh domifaddr`, which can ask the DHCP server of a
//! libvirt network, the QEMU guest agent, or the host's ARP table.

use clap::{Parser, ValueEnum};
use color_eyre::{
    eyre::{bail, eyre, Context},
    Result,
};
use serde::Serialize;

use super::virsh::Virsh;
use super::{print_json, LibvirtOptions};

/// Where interface addresses are looked up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum AddressSource {
    /// DHCP leases of libvirt managed networks
    #[default]
    Lease,
    /// QEMU guest agent running inside the domain
    Agent,
    /// ARP table of the host
    Arp,
}

impl AddressSource {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Lease => "lease",
            Self::Agent => "agent",
            Self::Arp => "arp",
        }
    }
}

/// Options for listing the interfaces of a domain
#[derive(Debug, Parser)]
pub struct DomainIfaceListOpts {
    /// Name of the domain
    pub domain: String,

    /// Source of the addresses
    #[clap(long, value_enum, default_value_t)]
    pub source: AddressSource,
}

/// IP protocol of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AddressType {
    /// Internet Protocol version 4
    IPv4,
    /// Internet Protocol version 6
    IPv6,
}

/// An address assigned to an interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressDescriptor {
    /// The address itself, without prefix length
    pub address: String,
    /// Prefix length of the network
    pub prefix: u8,
    /// Protocol
    #[serde(rename = "type")]
    pub kind: AddressType,
}

/// A network interface of a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceDescriptor {
    /// Interface name, as seen by the host or the guest depending on the source
    pub name: String,
    /// MAC address
    pub hwaddr: Option<String>,
    /// Assigned addresses, sorted
    pub addresses: Vec<AddressDescriptor>,
}

/// Columns that `domifaddr` prints when a value is absent
fn is_placeholder(s: &str) -> bool {
    s == "-" || s == "N/A"
}

fn parse_address(protocol: &str, address: &str) -> Result<AddressDescriptor> {
    let kind = match protocol {
        "ipv4" => AddressType::IPv4,
        "ipv6" => AddressType::IPv6,
        other => bail!("Unknown address type: {other}"),
    };
    let (address, prefix) = address
        .split_once('/')
        .ok_or_else(|| eyre!("Address without prefix length: {address}"))?;
    let prefix = prefix
        .parse::<u8>()
        .with_context(|| format!("Invalid prefix length in {address}/{prefix}"))?;
    Ok(AddressDescriptor {
        address: address.to_owned(),
        prefix,
        kind,
    })
}

/// Parse the table printed by `virsh domifaddr`
///
/// Continuation rows repeat neither name nor MAC and show `-` instead; they
/// belong to the interface above them.
pub fn parse_domifaddr(out: &str) -> Result<Vec<InterfaceDescriptor>> {
    let mut interfaces: Vec<InterfaceDescriptor> = Vec::new();
    let mut current = None;
    for line in out.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [name, hwaddr, rest @ ..] = fields.as_slice() else {
            continue;
        };
        if !(*name == "-" && *hwaddr == "-") {
            let hwaddr = (!is_placeholder(hwaddr)).then(|| hwaddr.to_string());
            // With --full, every row repeats the interface
            let existing = interfaces
                .iter()
                .position(|i| i.name == *name && i.hwaddr == hwaddr);
            current = Some(existing.unwrap_or_else(|| {
                interfaces.push(InterfaceDescriptor {
                    name: name.to_string(),
                    hwaddr,
                    addresses: Vec::new(),
                });
                interfaces.len() - 1
            }));
        }
        let Some(idx) = current else {
            bail!("Address row before any interface: {line}");
        };
        if let [protocol, address, ..] = rest {
            if !is_placeholder(protocol) && !is_placeholder(address) {
                interfaces[idx]
                    .addresses
                    .push(parse_address(protocol, address)?);
            }
        }
    }
    for iface in interfaces.iter_mut() {
        iface.addresses.sort_by(|a, b| a.address.cmp(&b.address));
    }
    interfaces.sort_by(|a, b| a.hwaddr.cmp(&b.hwaddr));
    Ok(interfaces)
}

/// Interfaces of `domain` with their addresses, sorted by MAC address
pub fn list_interfaces(
    virsh: &Virsh,
    domain: &str,
    source: AddressSource,
) -> Result<Vec<InterfaceDescriptor>> {
    if !virsh.domain_exists(domain)? {
        bail!("Domain '{domain}' does not exist");
    }
    let out = virsh
        .run(["domifaddr", domain, "--source", source.as_str()])
        .with_context(|| format!("Querying interface addresses of domain '{domain}'"))?;
    parse_domifaddr(&out)
        .with_context(|| format!("Parsing interface addresses of domain '{domain}'"))
}

/// Execute the domain-iface-list command
pub fn run(global_opts: &LibvirtOptions, opts: DomainIfaceListOpts) -> Result<()> {
    let interfaces = list_interfaces(&global_opts.virsh(), &opts.domain, opts.source)?;
    print_json(&interfaces)
}
