//! qvm - load and call sandboxed game modules from the command line.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

mod commands;
mod config;
mod host;

#[derive(Parser)]
#[command(
    name = "qvm",
    version,
    about = "Host for sandboxed QVM game modules",
    long_about = "Loads game modules (vm/<name>.qvm images or native libraries) and calls into them.\n\n\
                  Call a module:   qvm run qagame --selector 0 1 2\n\
                  Inspect images:  qvm disasm baseq3/vm/ui.qvm"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress load progress
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a module and call it once
    Run(commands::run::RunCommand),

    /// Load modules and list the registry
    Info(commands::info::InfoCommand),

    /// Disassemble an image file
    Disasm(commands::disasm::DisasmCommand),

    /// Call a module repeatedly and print its call profile
    Profile(commands::profile::ProfileCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .with_writer(std::io::stderr)
        .init();

    let mut config = config::load_config(cli.config.as_deref())?;
    config.quiet |= cli.quiet;
    if cli.verbose {
        config.debug_level = config.debug_level.max(1);
    }

    match cli.command {
        Commands::Run(cmd) => cmd.run(config),
        Commands::Info(cmd) => cmd.run(config),
        Commands::Disasm(cmd) => cmd.run(),
        Commands::Profile(cmd) => cmd.run(config),
    }
}
