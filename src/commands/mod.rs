//! Command module - Strategy pattern for CLI commands.
//!
//! Each command is a separate module implementing the `CommandExecutor` trait.

mod client;
mod server;

pub use client::ClientCommand;
pub use server::ServerCommand;

use std::path::Path;

use anyhow::{Context, Result};

use sirius::chat::SiriusConfig;

/// Trait for command execution - Strategy pattern.
///
/// Each command struct holds its parsed arguments and implements
/// this trait to define its execution logic.
pub trait CommandExecutor {
    /// Executes the command with its parsed arguments.
    fn execute(&self) -> Result<()>;
}

/// Load the TOML config file if one was given, defaults otherwise.
fn load_config(path: Option<&Path>) -> Result<SiriusConfig> {
    match path {
        Some(path) => SiriusConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(SiriusConfig::default()),
    }
}

/// Build a multi-threaded tokio runtime for a command.
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create tokio runtime")
}
