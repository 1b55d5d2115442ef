//! Chat server.
//!
//! One task per accepted connection. Each task runs the handshake, attaches
//! the connection to the shared [`Registry`] and then reads client messages
//! until the peer leaves, the transport breaks, or another login takes its
//! nickname.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::chat::config::ServerConfig;
use crate::chat::error::ChatError;
use crate::chat::handshake::{accept_handshake, HandshakePhase};
use crate::chat::protocol::{ClientMessage, FileUpload, Login, PrivatePost, PublicPost};
use crate::chat::registry::{ConnectionHandle, ConnectionId, Registry, PUBLIC_RECIPIENT};
use crate::chat::transport::{FrameReader, Framed, MessageTransport, TcpListener};
use crate::crypto::{open_text, KeyPair};

/// First pause after a failed `accept`; doubled on each further failure.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);

/// Longest pause between failed `accept` calls.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Shared server context.
pub struct Server {
    identity: KeyPair,
    registry: Registry,
    config: ServerConfig,
    next_id: AtomicU64,
}

/// Per-connection state owned by its task.
struct Session {
    id: ConnectionId,
    peer: SocketAddr,
    nickname: String,
    handle: Arc<ConnectionHandle>,
}

impl Server {
    /// Validate `config` and generate a fresh RSA identity.
    pub fn new(config: ServerConfig) -> Result<Self, ChatError> {
        config.validate()?;
        let identity = KeyPair::generate_with_bits(config.rsa_bits)?;
        Ok(Self::with_identity(config, identity))
    }

    /// Use an existing key pair.
    pub fn with_identity(config: ServerConfig, identity: KeyPair) -> Self {
        Self {
            identity,
            registry: Registry::with_max_frame_len(config.max_frame_len),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn identity(&self) -> &KeyPair {
        &self.identity
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address.
    pub async fn listen(&self) -> Result<TcpListener, ChatError> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Accept connections forever.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), ChatError> {
        info!(addr = %listener.local_addr()?, bits = self.identity.bits(), "chat server listening");
        let mut backoff = None;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => {
                    backoff = None;
                    accepted
                }
                Err(error) => {
                    // Out of file descriptors and similar; retrying at once would spin.
                    let pause = next_backoff(backoff);
                    warn!(?pause, "accept failed: {error}");
                    tokio::time::sleep(pause).await;
                    backoff = Some(pause);
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_stream(stream, peer).await;
            });
        }
    }

    async fn serve_stream(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {error}");
        }
        let (reader, writer) = stream.into_split();
        self.serve_io(reader, writer, peer).await;
    }

    /// Serve one connection until it ends.
    pub async fn serve_io<R, W>(&self, reader: R, writer: W, peer: SocketAddr)
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        debug!(%peer, "connection accepted");
        let mut transport = Framed::with_max_frame_len(
            reader,
            writer,
            peer.to_string(),
            self.config.max_frame_len,
        );

        let secured = match accept_handshake(&mut transport, &self.identity).await {
            Ok(secured) => secured,
            Err(_) => {
                // accept_handshake already logged the reason.
                if let Err(error) = transport.close().await {
                    debug!(%peer, "close failed: {error}");
                }
                return;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (mut reader, writer) = transport.into_parts();
        let handle = Arc::new(ConnectionHandle::new(
            id,
            peer.to_string(),
            secured.session_key,
            writer.into_inner(),
        ));
        self.registry.attach(handle.clone());
        info!(%peer, connection = id, "secure channel established");

        let mut session = Session {
            id,
            peer,
            nickname: format!("user_{}", peer.port()),
            handle,
        };
        self.read_loop(&mut session, &mut reader).await;

        self.registry.unregister(session.id).await;
        session.handle.shutdown().await;
        info!(%peer, nickname = %session.nickname, "connection closed");
    }

    async fn read_loop<R>(&self, session: &mut Session, reader: &mut FrameReader<R>)
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            let next = tokio::select! {
                _ = session.handle.evicted() => {
                    info!(peer = %session.peer, nickname = %session.nickname, "evicted");
                    return;
                }
                next = reader.next::<ClientMessage>() => next,
            };

            match next {
                Ok(Some(message)) => {
                    let kind = message.kind();
                    if let Err(error) = self.dispatch(session, message).await {
                        warn!(peer = %session.peer, nickname = %session.nickname, kind, "dropping message: {error}");
                    }
                }
                Ok(None) => return,
                Err(error) if error.is_transport() => {
                    warn!(peer = %session.peer, "transport error: {error}");
                    return;
                }
                Err(error) => {
                    warn!(peer = %session.peer, "ignoring frame: {error}");
                }
            }
        }
    }

    async fn dispatch(&self, session: &mut Session, message: ClientMessage) -> Result<(), ChatError> {
        match message {
            ClientMessage::Login(Login { nickname }) => {
                let nickname = nickname.trim();
                if nickname.is_empty() || nickname == PUBLIC_RECIPIENT {
                    return Err(ChatError::InvalidNickname(nickname.to_string()));
                }
                self.registry.register(session.id, nickname).await?;
                session.nickname = nickname.to_string();
                Ok(())
            }

            ClientMessage::PublicMessage(PublicPost { content }) => {
                let text = open_text(session.handle.session_key(), &content)?;
                debug!(from = %session.nickname, %text, "public message");
                self.registry
                    .broadcast_public(session.id, &session.nickname, &text)
                    .await
            }

            ClientMessage::PrivateMessage(PrivatePost { recipient, content }) => {
                let text = open_text(session.handle.session_key(), &content)?;
                debug!(from = %session.nickname, to = %recipient, %text, "private message");
                self.registry
                    .route_direct(session.id, &session.nickname, &recipient, &text)
                    .await
            }

            ClientMessage::FileTransfer(upload) => {
                validate_file(&upload)?;
                info!(from = %session.nickname, to = %upload.recipient, filename = %upload.filename, "relaying file");
                self.registry
                    .relay_file(session.id, &session.nickname, upload)
                    .await
            }

            other => Err(ChatError::UnexpectedMessageType {
                phase: HandshakePhase::SecureChannelReady,
                got: other.kind().to_string(),
            }),
        }
    }
}

fn next_backoff(current: Option<Duration>) -> Duration {
    match current {
        Some(pause) => (pause * 2).min(ACCEPT_BACKOFF_MAX),
        None => ACCEPT_BACKOFF_MIN,
    }
}

fn validate_file(upload: &FileUpload) -> Result<(), ChatError> {
    if upload.filename.trim().is_empty() {
        return Err(ChatError::MalformedMessage("empty filename".to_string()));
    }
    BASE64
        .decode(upload.content.trim())
        .map_err(|e| ChatError::MalformedMessage(format!("file content is not Base64: {}", e)))?;
    Ok(())
}
