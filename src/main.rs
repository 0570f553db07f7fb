//! vmhost CLI entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vmhost::config::{AgentConfig, CONFIG_ENV};

mod cli;

/// vmhost - per-host VM environment agent
#[derive(Parser, Debug)]
#[command(name = "vmhost")]
#[command(about = "Prepare, recreate and purge the host environment of a VM")]
#[command(version)]
struct Cli {
    /// Agent configuration file.
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision a VM: user, disks, keys, network, hugepages and units.
    ///
    /// Wrapping secrets for encrypted volumes are read as JSON from stdin.
    Setup(cli::setup::SetupCmd),

    /// Rebuild the resources a host reboot loses.
    RecreateUnpersisted(cli::recreate::RecreateCmd),

    /// Remove every resource of a VM.
    Purge(cli::purge::PurgeCmd),
}

fn main() {
    let cli = Cli::parse();

    init_logging(cli.log_json);

    tracing::debug!(version = vmhost::VERSION, "starting vmhost");
    cli::warn_if_unprivileged();

    let result = AgentConfig::load(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Setup(cmd) => cmd.run(&config),
        Commands::RecreateUnpersisted(cmd) => cmd.run(&config),
        Commands::Purge(cmd) => cmd.run(&config),
    });

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmhost=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
