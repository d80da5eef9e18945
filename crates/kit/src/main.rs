//! virtmate command line entry point.
use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

use virtmate::clone::CloneError;
use virtmate::config::Config;
use virtmate::libvirt::{
    self, clone::DomainCloneOpts, guest_ping::GuestPingOpts, iface_list::DomainIfaceListOpts,
    import::VolumeImportOpts, list::DomainListOpts, list_pools::PoolListOpts,
    list_volumes::VolumeListOpts, LibvirtOptions,
};

/// Manage libvirt virtual machines from scripts.
///
/// virtmate wraps common libvirt chores in commands that print JSON: listing
/// domains, pools and volumes, asking the guest agent whether a guest is up,
/// importing disk images and cloning shut off domains.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Hypervisor connection URI (e.g., qemu:///system, qemu+ssh://host/system)
    ///
    /// Defaults to `libvirt.connect` from the configuration file, then to
    /// libvirt's own default.
    #[clap(short = 'c', long = "connection", global = true)]
    connect: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available virtmate commands
#[derive(Subcommand)]
enum Commands {
    /// List all domains, active or not
    DomainList(DomainListOpts),

    /// Clone a shut off domain, including its disks and firmware store
    DomainClone(DomainCloneOpts),

    /// List network interfaces and addresses of a running domain
    DomainIfaceList(DomainIfaceListOpts),

    /// Check whether the QEMU guest agent of a domain responds
    GuestPing(GuestPingOpts),

    /// List storage pools
    PoolList(PoolListOpts),

    /// List the volumes of a storage pool
    VolumeList(VolumeListOpts),

    /// Import a local disk image into a storage pool
    VolumeImport(VolumeImportOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by RUST_LOG environment variable, defaulting to 'info',
/// and always go to stderr so stdout stays parseable.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Run a command, returning the process exit status
fn run(cli: Cli) -> Result<i32> {
    let config = Config::load()?;
    let global_opts = LibvirtOptions {
        connect: config.connect_uri(cli.connect),
    };

    match cli.command {
        Commands::DomainList(opts) => libvirt::list::run(&global_opts, opts)?,
        Commands::DomainClone(opts) => libvirt::clone::run(&global_opts, config.clone.mode, opts)?,
        Commands::DomainIfaceList(opts) => libvirt::iface_list::run(&global_opts, opts)?,
        Commands::GuestPing(opts) => {
            if !libvirt::guest_ping::run(&global_opts, opts)? {
                return Ok(1);
            }
        }
        Commands::PoolList(opts) => libvirt::list_pools::run(&global_opts, opts)?,
        Commands::VolumeList(opts) => libvirt::list_volumes::run(&global_opts, opts)?,
        Commands::VolumeImport(opts) => libvirt::import::run(&global_opts, opts)?,
    }
    Ok(0)
}

/// Exit status for a failed command; internal errors get their own
fn exit_code(e: &Report) -> i32 {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<CloneError>())
        .map(CloneError::exit_code)
        .unwrap_or(1)
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code(&e);
            if code == 1 {
                return Err(e);
            }
            eprintln!("Error: {e:?}");
            code
        }
    };
    tracing::debug!("exiting");
    std::process::exit(code)
}
