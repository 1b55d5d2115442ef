//! # Sirius - encrypted TCP chat
//!
//! A chat server and client where every connection is authenticated and
//! encrypted before any chat traffic flows.
//!
//! ## Security Model
//!
//! - **RSA-OAEP (SHA-256)** protects the handshake secrets
//! - **OTP challenge** proves possession of the client's private key
//! - **AES-256-GCM** with a fresh 96-bit nonce per message protects chat
//! - **Per-recipient sealing**: no two clients share a session key
//! - **Zeroize**: session keys and challenges are wiped on drop
//!
//! Roster updates and file transfers are not sealed.
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use sirius::chat::{ClientConfig, Server, ServerConfig, TcpChatClient};
//! use sirius::crypto::KeyPair;
//!
//! # async fn demo() -> Result<(), sirius::chat::ChatError> {
//! let server = Arc::new(Server::new(ServerConfig::default())?);
//! let listener = server.listen().await?;
//! tokio::spawn(server.run(listener));
//!
//! let identity = KeyPair::generate()?;
//! let mut client = TcpChatClient::connect(&ClientConfig::default(), &identity).await?;
//! client.login("alice").await?;
//! client.send_public("hello").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: RSA keys, OAEP, challenges and the AES-GCM codec
//! - [`chat`]: wire protocol, framing, handshake, server, client

pub mod chat;
pub mod crypto;
