//! Sirius - encrypted TCP chat
//!
//! Run `sirius server` to host a chat and `sirius client --nick <name>` to join one.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{prelude::*, EnvFilter};

mod commands;

use commands::{ClientCommand, CommandExecutor, ServerCommand};

/// Sirius - encrypted TCP chat
///
/// Every connection exchanges RSA keys, proves possession of its private key
/// with a one-time password and then talks over an AES-GCM session key.
#[derive(Parser)]
#[command(name = "sirius")]
#[command(version)]
#[command(about = "Encrypted TCP chat with RSA key exchange and AES-GCM sessions")]
#[command(long_about = None)]
struct Cli {
    /// Verbose logging (debug level unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a chat server
    Server(ServerCommand),

    /// Join a chat server
    Client(ClientCommand),
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::builder().parse(format!(
        "sirius={},{}",
        level,
        std::env::var("RUST_LOG").unwrap_or_default()
    ))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Server(command) => command.execute(),
        Commands::Client(command) => command.execute(),
    }
}
