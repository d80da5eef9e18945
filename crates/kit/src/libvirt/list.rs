//! domain-list command - list all defined domains
//!
//! Active and inactive domains are listed, sorted by UUID.

use clap::Parser;
use color_eyre::{eyre::Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use uuid::Uuid;

use super::virsh::Virsh;
use super::{print_json, LibvirtOptions, OutputFormat};
use crate::clone::model::DomainState;

/// Options for listing libvirt domains
#[derive(Debug, Parser)]
pub struct DomainListOpts {
    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
}

/// One line of `domain-list` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainDescriptor {
    /// Domain UUID
    pub uuid: Uuid,
    /// Domain name
    pub name: String,
    /// Lifecycle state
    pub state: DomainState,
}

/// Describe every defined domain
pub fn list_domains(virsh: &Virsh) -> Result<Vec<DomainDescriptor>> {
    let mut domains = Vec::new();
    for name in virsh.domain_names().context("Listing domains")? {
        let uuid = virsh
            .domain_uuid(&name)
            .with_context(|| format!("Getting UUID of domain '{name}'"))?;
        let state = virsh
            .domain_state(&name)
            .with_context(|| format!("Getting state of domain '{name}'"))?;
        domains.push(DomainDescriptor { uuid, name, state });
    }
    domains.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    Ok(domains)
}

/// Execute the domain-list command
pub fn run(global_opts: &LibvirtOptions, opts: DomainListOpts) -> Result<()> {
    let domains = list_domains(&global_opts.virsh())?;
    match opts.format {
        OutputFormat::Json => print_json(&domains)?,
        OutputFormat::Table => {
            if domains.is_empty() {
                println!("No domains found");
                return Ok(());
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["NAME", "UUID", "STATE"]);
            for domain in &domains {
                table.add_row(vec![
                    domain.name.clone(),
                    domain.uuid.to_string(),
                    domain.state.to_string(),
                ]);
            }
            println!("{}", table);
        }
    }
    Ok(())
}
