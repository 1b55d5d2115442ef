//! Server and client configuration.
//!
//! Both sections can be loaded from a single TOML file:
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:5000"
//! rsa_bits = 3072
//!
//! [client]
//! server_addr = "chat.example.org:5000"
//! ```
//!
//! Missing keys fall back to the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chat::error::ChatError;
use crate::crypto::{DEFAULT_RSA_BITS, MIN_RSA_BITS};

/// Default server bind address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";

/// Default address a client connects to.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5000";

/// Default upper bound for a single frame body (64 MiB, files travel inline).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Smallest frame limit we accept in configuration.
pub const MIN_MAX_FRAME_LEN: usize = 4 * 1024;

/// Configuration for the chat server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: String,

    /// RSA modulus size for the server key pair.
    pub rsa_bits: usize,

    /// Maximum accepted frame body in bytes.
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            rsa_bits: DEFAULT_RSA_BITS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ChatError> {
        validate_common(self.rsa_bits, self.max_frame_len)?;
        if self.bind_addr.trim().is_empty() {
            return Err(ChatError::Config("bind_addr must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Configuration for the chat client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Server to connect to.
    pub server_addr: String,

    /// RSA modulus size for the client key pair.
    pub rsa_bits: usize,

    /// Maximum accepted frame body in bytes.
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            rsa_bits: DEFAULT_RSA_BITS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ClientConfig {
    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ChatError> {
        validate_common(self.rsa_bits, self.max_frame_len)?;
        if self.server_addr.trim().is_empty() {
            return Err(ChatError::Config("server_addr must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SiriusConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl SiriusConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ChatError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ChatError::Config(e.to_string()))?;
        config.server.validate()?;
        config.client.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ChatError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ChatError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }
}

fn validate_common(rsa_bits: usize, max_frame_len: usize) -> Result<(), ChatError> {
    if rsa_bits < MIN_RSA_BITS {
        return Err(ChatError::Config(format!(
            "rsa_bits must be at least {}, got {}",
            MIN_RSA_BITS, rsa_bits
        )));
    }
    if max_frame_len < MIN_MAX_FRAME_LEN {
        return Err(ChatError::Config(format!(
            "max_frame_len must be at least {}, got {}",
            MIN_MAX_FRAME_LEN, max_frame_len
        )));
    }
    Ok(())
}
