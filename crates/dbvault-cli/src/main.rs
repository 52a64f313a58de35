mod cli;
mod cmd;
mod config_gen;
mod dispatch;
mod format;
mod signal;
mod table;

use clap::Parser;

use dbvault_core::app::{self, Vault};
use dbvault_core::config;

use cli::{Cli, Commands};
use config_gen::run_config_generate;
use dispatch::dispatch_command;

fn main() {
    let cli = Cli::parse();

    // Daemon logs at info unless asked otherwise.
    let filter = match cli.verbose {
        0 if matches!(cli.command, Commands::Daemon) => "info",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // No config file needed for these.
    match &cli.command {
        Commands::Config { dest } => {
            if let Err(e) = run_config_generate(dest) {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
            return;
        }
        Commands::Keygen { id } => {
            cmd::keygen::run_keygen(id);
            return;
        }
        _ => {}
    }

    signal::install_signal_handlers();

    let runtime = match app::load_runtime_config(cli.config.as_deref()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {e}");
            if cli.config.is_none() {
                eprintln!("Searched:");
                for (path, level) in config::default_config_search_paths() {
                    eprintln!("  {} ({})", path.display(), level);
                }
                eprintln!();
                eprintln!("Run `dbvault config` to generate a starter config file.");
            }
            std::process::exit(1);
        }
    };
    tracing::info!("Using config: {}", runtime.source);

    let vault = match Vault::open(runtime.config) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let name = cli.command.name();
    if let Err(e) = dispatch_command(cli.command, vault) {
        tracing::debug!(command = name, "command failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
