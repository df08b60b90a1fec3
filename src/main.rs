//! vboxctl CLI entry point.

use clap::{Parser, Subcommand};
use vboxctl::config::ClientConfig;
use tracing_subscriber::EnvFilter;

mod cli;

/// vboxctl - manage virtual machines through the management API
#[derive(Parser, Debug)]
#[command(name = "vboxctl")]
#[command(about = "Manage virtual machines through the management API")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: cli::GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show registered objects (`show vms`).
    #[command(subcommand)]
    Show(cli::show::ShowCmd),

    /// List host properties (`list hostinfo`).
    #[command(subcommand)]
    List(cli::list::ListCmd),

    /// Start a machine.
    #[command(name = "startvm")]
    StartVm(cli::start::StartVmCmd),

    /// Power down a machine.
    #[command(name = "stopvm")]
    StopVm(cli::stop::StopVmCmd),

    /// Print a machine log.
    #[command(name = "showlog")]
    ShowLog(cli::log::ShowLogCmd),

    /// Search a machine log.
    #[command(name = "findlog")]
    FindLog(cli::log::FindLogCmd),

    /// Print events as they arrive.
    Events(cli::events::EventsCmd),

    /// Collect performance metrics.
    Stats(cli::stats::StatsCmd),

    /// Print client and server versions.
    Version(cli::version::VersionCmd),

    /// Serve a simulated platform over HTTP.
    Serve(cli::serve::ServeCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = vboxctl::VERSION, "starting vboxctl");

    let config = match ClientConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            ClientConfig::default()
        }
    };

    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(&cli.global),
        command => cli::Context::new(cli.global, config).and_then(|ctx| match command {
            Commands::Show(cmd) => cmd.run(&ctx),
            Commands::List(cmd) => cmd.run(&ctx),
            Commands::StartVm(cmd) => cmd.run(&ctx),
            Commands::StopVm(cmd) => cmd.run(&ctx),
            Commands::ShowLog(cmd) => cmd.run(&ctx),
            Commands::FindLog(cmd) => cmd.run(&ctx),
            Commands::Events(cmd) => cmd.run(&ctx),
            Commands::Stats(cmd) => cmd.run(&ctx),
            Commands::Version(cmd) => cmd.run(&ctx),
            Commands::Serve(_) => Ok(()),
        }),
    };

    // Failures are reported; teardown has already run inside the command.
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        cli::report(&e);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vboxctl=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
