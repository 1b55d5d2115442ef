//! # Sirius Chat
//!
//! Multi-user chat over TCP. Every connection is secured before it may
//! chat:
//!
//! - **RSA key exchange**: both sides announce an RSA-2048+ public key (SPKI PEM)
//! - **Challenge-response**: the server proves the client holds its private
//!   key with a 6-digit one-time code encrypted under RSA-OAEP
//! - **Session key**: the client picks a 32-byte AES-256-GCM key and sends it
//!   under the server's public key
//! - **Per-recipient sealing**: the server opens each chat message with the
//!   sender's key and seals it again for every recipient
//!
//! Frames are `[u32 big-endian length][JSON envelope]`.

pub mod client;
pub mod config;
mod error;
pub mod handshake;
pub mod input;
pub mod protocol;
pub mod registry;
pub mod render;
pub mod server;
pub mod transcript;
pub mod transport;

pub use client::{ChatClient, ChatEvent, ClientReceiver, ClientSender, TcpChatClient};
pub use config::{ClientConfig, ServerConfig, SiriusConfig};
pub use error::ChatError;
pub use handshake::{HandshakePhase, SecuredSession};
pub use registry::{ConnectionId, Registry, PUBLIC_RECIPIENT};
pub use render::{MessageRenderer, TerminalRenderer};
pub use server::Server;
pub use transcript::{ChatLine, ConversationStore, FileTranscript, LineAuthor, Transcript};
