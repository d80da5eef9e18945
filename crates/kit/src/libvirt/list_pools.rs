//! pool-list command - list all storage pools

use std::collections::HashMap;

use clap::Parser;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::BinaryBytes;
use serde::Serialize;
use uuid::Uuid;

use super::virsh::Virsh;
use super::{print_json, LibvirtOptions, OutputFormat};
use crate::clone::domain_xml::parse_sized;
use crate::xml_utils::XmlNode;

/// Options for listing storage pools
#[derive(Debug, Parser)]
pub struct PoolListOpts {
    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
}

/// One entry of `pool-list` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolDescriptor {
    /// Pool name
    pub name: String,
    /// Pool UUID
    pub uuid: Uuid,
    /// `inactive`, `building`, `running`, `degraded`, `inaccessible` or `unknown`
    pub state: String,
    /// Whether the pool is running
    pub active: bool,
    /// Whether the pool definition survives a restart of the daemon
    pub persistent: bool,
    /// Total size in bytes
    pub capacity: Option<u64>,
    /// Bytes in use
    pub allocation: Option<u64>,
    /// Bytes free
    pub available: Option<u64>,
    /// Number of volumes; only known for active pools
    pub number_of_volumes: Option<usize>,
}

/// `Key: value` lines of `virsh pool-info`
fn parse_info(out: &str) -> HashMap<&str, &str> {
    out.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

fn pool_state(state: &str) -> &'static str {
    match state {
        "inactive" => "inactive",
        "building" => "building",
        "running" => "running",
        "degraded" => "degraded",
        "inaccessible" => "inaccessible",
        _ => "unknown",
    }
}

/// Build a descriptor from `pool-dumpxml` and `pool-info` output
fn describe_pool(doc: &XmlNode, info: &str) -> Result<PoolDescriptor> {
    let name = doc
        .child("name")
        .map(|n| n.text_content().trim().to_owned())
        .ok_or_else(|| eyre!("Pool XML without <name>"))?;
    let uuid = doc
        .child("uuid")
        .map(|n| n.text_content())
        .ok_or_else(|| eyre!("Pool XML of '{name}' without <uuid>"))?;
    let uuid = Uuid::parse_str(uuid.trim())
        .with_context(|| format!("Invalid UUID of pool '{name}'"))?;
    let info = parse_info(info);
    let state = pool_state(info.get("State").copied().unwrap_or_default());
    let persistent = info.get("Persistent").copied() == Some("yes");
    Ok(PoolDescriptor {
        uuid,
        state: state.to_owned(),
        active: state == "running",
        persistent,
        capacity: doc.child("capacity").and_then(parse_sized),
        allocation: doc.child("allocation").and_then(parse_sized),
        available: doc.child("available").and_then(parse_sized),
        number_of_volumes: None,
        name,
    })
}

/// Describe every storage pool, sorted by name
pub fn list_pools(virsh: &Virsh) -> Result<Vec<PoolDescriptor>> {
    let mut pools = Vec::new();
    for name in virsh.pool_names().context("Listing storage pools")? {
        let doc = virsh
            .run_xml(&["pool-dumpxml", name.as_str()])
            .with_context(|| format!("Reading definition of pool '{name}'"))?;
        let info = virsh
            .run(["pool-info", name.as_str()])
            .with_context(|| format!("Getting state of pool '{name}'"))?;
        let mut pool = describe_pool(&doc, &info)?;
        if pool.active {
            let volumes = virsh
                .volume_names(&name)
                .with_context(|| format!("Listing volumes of pool '{name}'"))?;
            pool.number_of_volumes = Some(volumes.len());
        }
        pools.push(pool);
    }
    pools.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(pools)
}

/// Execute the pool-list command
pub fn run(global_opts: &LibvirtOptions, opts: PoolListOpts) -> Result<()> {
    let pools = list_pools(&global_opts.virsh())?;
    match opts.format {
        OutputFormat::Json => print_json(&pools)?,
        OutputFormat::Table => {
            if pools.is_empty() {
                println!("No storage pools found");
                return Ok(());
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["NAME", "STATE", "CAPACITY", "AVAILABLE", "VOLUMES"]);
            for pool in &pools {
                let size = |s: Option<u64>| s.map(|s| BinaryBytes(s).to_string());
                table.add_row(vec![
                    pool.name.clone(),
                    pool.state.clone(),
                    size(pool.capacity).unwrap_or_default(),
                    size(pool.available).unwrap_or_default(),
                    pool.number_of_volumes
                        .map(|n| n.to_string())
                        .unwrap_or_default(),
                ]);
            }
            println!("{}", table);
        }
    }
    Ok(())
}
