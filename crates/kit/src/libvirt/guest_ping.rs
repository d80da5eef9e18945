//! guest-ping command - check whether the QEMU guest agent answers

use clap::Parser;
use color_eyre::{
    eyre::{bail, Context},
    Result,
};
use tracing::debug;

use super::virsh::Virsh;
use super::LibvirtOptions;
use crate::cmdext::{CommandError, CommandRunExt};

const GUEST_PING: &str = r#"{"execute":"guest-ping"}"#;

/// Options for pinging the guest agent of a domain
#[derive(Debug, Parser)]
pub struct GuestPingOpts {
    /// Name of the domain
    pub domain: String,
}

/// Whether the guest agent of `domain` responded
///
/// An agent that is not installed, not running, or a domain that is shut off
/// all count as no response. A domain that does not exist is an error.
pub fn ping_guest(virsh: &Virsh, domain: &str) -> Result<bool> {
    if !virsh.domain_exists(domain)? {
        bail!("Domain '{domain}' does not exist");
    }
    let response = virsh
        .command()
        .args(["qemu-agent-command", domain, GUEST_PING])
        .run_and_parse_json::<serde_json::Value>();
    match response {
        Ok(v) => {
            debug!("guest-ping response: {v}");
            Ok(true)
        }
        Err(CommandError::Failed { stderr, .. }) => {
            debug!("No response from guest agent of {domain}: {stderr}");
            Ok(false)
        }
        Err(e) => Err(e).with_context(|| format!("Pinging guest agent of domain '{domain}'")),
    }
}

/// Execute the guest-ping command; returns whether the agent answered
pub fn run(global_opts: &LibvirtOptions, opts: GuestPingOpts) -> Result<bool> {
    ping_guest(&global_opts.virsh(), &opts.domain)
}
