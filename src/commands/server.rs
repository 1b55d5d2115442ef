//! Chat server command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use sirius::chat::{Server, ServerConfig};

use super::{load_config, runtime, CommandExecutor};

/// Run the chat server.
#[derive(Args, Debug)]
pub struct ServerCommand {
    /// Address to listen on, e.g. 0.0.0.0:5000 (overrides the config file)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// RSA key size in bits (minimum 2048)
    #[arg(long)]
    pub rsa_bits: Option<usize>,
}

impl ServerCommand {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = load_config(self.config.as_deref())?.server;
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(bits) = self.rsa_bits {
            config.rsa_bits = bits;
        }
        config.validate()?;
        Ok(config)
    }
}

impl CommandExecutor for ServerCommand {
    fn execute(&self) -> Result<()> {
        let config = self.server_config()?;

        info!(bits = config.rsa_bits, "generating server key pair");
        let server = Arc::new(Server::new(config).context("Failed to initialize server")?);

        runtime()?.block_on(async move {
            let listener = server
                .listen()
                .await
                .with_context(|| format!("Failed to bind {}", server.config().bind_addr))?;
            println!("Sirius server listening on {}", listener.local_addr()?);

            tokio::select! {
                result = server.clone().run(listener) => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!(connections = server.registry().live_count(), "shutting down");
                }
            }
            Ok::<(), anyhow::Error>(())
        })
    }
}
