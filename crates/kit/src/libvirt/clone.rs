//! domain-clone command - duplicate a shut off domain under a new name
//!
//! The work is done by [`crate::clone::clone_domain`]; this module only
//! resolves the clone mode and prints the result.

use clap::Parser;
use color_eyre::Result;
use tracing::debug;

use super::{print_json, LibvirtOptions};
use crate::clone::{clone_domain, CloneMode, CloneRequest};

/// Options for cloning a domain
#[derive(Debug, Parser)]
pub struct DomainCloneOpts {
    /// Name of the shut off domain to clone
    pub domain: String,

    /// Name of the new domain
    pub newname: String,

    /// How disk images are duplicated
    ///
    /// `copy` makes independent full copies, `linked` creates qcow2 overlays
    /// backed by the original disks (which must then stay untouched), and
    /// `reflink` shares extents with the original on filesystems that support
    /// it (raw images only). Defaults to `clone.mode` from the configuration
    /// file, or `copy`.
    #[clap(long, value_enum)]
    pub mode: Option<CloneMode>,
}

impl DomainCloneOpts {
    /// The request to hand to the clone engine
    pub fn request(self, default_mode: CloneMode) -> CloneRequest {
        CloneRequest {
            source: self.domain,
            target: self.newname,
            mode: self.mode.unwrap_or(default_mode),
        }
    }
}

/// Execute the domain-clone command
pub fn run(
    global_opts: &LibvirtOptions,
    default_mode: CloneMode,
    opts: DomainCloneOpts,
) -> Result<()> {
    let request = opts.request(default_mode);
    debug!(
        "Cloning {} to {} ({} mode)",
        request.source, request.target, request.mode
    );
    let outcome = clone_domain(&global_opts.virsh(), request)?;
    print_json(&outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        opts: DomainCloneOpts,
    }

    fn parse(args: &[&str]) -> DomainCloneOpts {
        TestCli::try_parse_from(std::iter::once("domain-clone").chain(args.iter().copied()))
            .unwrap()
            .opts
    }

    #[test]
    fn test_mode_precedence() {
        let request = parse(&["web", "web2"]).request(CloneMode::Copy);
        assert_eq!(request.source, "web");
        assert_eq!(request.target, "web2");
        assert_eq!(request.mode, CloneMode::Copy);

        let request = parse(&["web", "web2"]).request(CloneMode::Linked);
        assert_eq!(request.mode, CloneMode::Linked);

        let request = parse(&["web", "web2", "--mode", "reflink"]).request(CloneMode::Linked);
        assert_eq!(request.mode, CloneMode::Reflink);
    }

    #[test]
    fn test_invalid_mode() {
        let args = ["domain-clone", "web", "web2", "--mode", "snapshot"];
        assert!(TestCli::try_parse_from(args).is_err());
    }
}
