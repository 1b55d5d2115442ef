//! Chat client library.
//!
//! [`TcpChatClient::connect`] opens a TCP connection and runs the client side of
//! the handshake. After that the client can log in, send public and private
//! messages and files, and read [`ChatEvent`]s. Incoming chat that fails to
//! decrypt becomes [`ChatEvent::Unreadable`] rather than an error.
//!
//! [`ChatClient::into_split`] separates the sending and receiving halves so a
//! frontend can read stdin and the socket concurrently.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

use crate::chat::config::ClientConfig;
use crate::chat::error::ChatError;
use crate::chat::handshake::initiate_handshake;
use crate::chat::protocol::{
    ClientMessage, Delivery, Echo, FileDelivery, FileUpload, Login, PrivatePost, PublicPost,
    ServerMessage,
};
use crate::chat::registry::PUBLIC_RECIPIENT;
use crate::chat::transport::{FrameReader, FrameWriter, Framed, TcpConnection};
use crate::crypto::{open_text, seal, KeyPair, SessionKey};

/// Conversation name used for public traffic.
pub const PUBLIC_CONVERSATION: &str = "public";

/// Something the server told us, already decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Broadcast from another user.
    Public { sender: String, text: String },
    /// Direct message to us.
    Private { sender: String, text: String },
    /// Our own direct message, echoed back by the server.
    PrivateEcho { recipient: String, text: String },
    /// Current nicknames, sorted.
    Roster(Vec<String>),
    /// A file, decoded from Base64.
    File {
        sender: String,
        recipient: String,
        filename: String,
        data: Vec<u8>,
    },
    /// A message we could not decrypt or decode.
    Unreadable { sender: String, kind: &'static str },
}

impl ChatEvent {
    /// Conversation this event belongs to, from the point of view of `me`.
    ///
    /// Public traffic lands in [`PUBLIC_CONVERSATION`], private traffic under
    /// the other party's nickname. Roster updates belong to no conversation.
    pub fn conversation(&self, me: &str) -> Option<&str> {
        match self {
            ChatEvent::Public { .. } => Some(PUBLIC_CONVERSATION),
            ChatEvent::Private { sender, .. } => Some(sender.as_str()),
            ChatEvent::PrivateEcho { recipient, .. } => Some(recipient.as_str()),
            ChatEvent::Roster(_) => None,
            ChatEvent::File {
                sender, recipient, ..
            } => {
                if recipient == PUBLIC_RECIPIENT {
                    Some(PUBLIC_CONVERSATION)
                } else if sender == me {
                    Some(recipient.as_str())
                } else {
                    Some(sender.as_str())
                }
            }
            ChatEvent::Unreadable { sender, kind } => {
                if *kind == "private_message" {
                    Some(sender.as_str())
                } else {
                    Some(PUBLIC_CONVERSATION)
                }
            }
        }
    }
}

/// Sending half of a client.
pub struct ClientSender<W> {
    writer: FrameWriter<W>,
    session_key: SessionKey,
    nickname: Option<String>,
}

impl<W: AsyncWrite + Unpin + Send> ClientSender<W> {
    /// Announce our nickname.
    pub async fn login(&mut self, nickname: &str) -> Result<(), ChatError> {
        self.writer
            .send(&ClientMessage::Login(Login {
                nickname: nickname.to_string(),
            }))
            .await?;
        self.nickname = Some(nickname.to_string());
        Ok(())
    }

    /// The nickname we last logged in with.
    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub async fn send_public(&mut self, text: &str) -> Result<(), ChatError> {
        let content = seal(&self.session_key, text.as_bytes())?;
        self.writer
            .send(&ClientMessage::PublicMessage(PublicPost { content }))
            .await
    }

    pub async fn send_private(&mut self, recipient: &str, text: &str) -> Result<(), ChatError> {
        let content = seal(&self.session_key, text.as_bytes())?;
        self.writer
            .send(&ClientMessage::PrivateMessage(PrivatePost {
                recipient: recipient.to_string(),
                content,
            }))
            .await
    }

    /// Send a file to `recipient`, or to everyone with [`PUBLIC_RECIPIENT`].
    ///
    /// File content travels Base64-encoded, not sealed.
    pub async fn send_file(
        &mut self,
        recipient: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<(), ChatError> {
        self.writer
            .send(&ClientMessage::FileTransfer(FileUpload {
                recipient: recipient.to_string(),
                filename: filename.to_string(),
                content: BASE64.encode(data),
            }))
            .await
    }

    /// Close the connection.
    pub async fn close(&mut self) -> Result<(), ChatError> {
        self.writer.shutdown().await
    }
}

/// Receiving half of a client.
pub struct ClientReceiver<R> {
    reader: FrameReader<R>,
    session_key: SessionKey,
}

impl<R: AsyncRead + Unpin + Send> ClientReceiver<R> {
    /// Wait for the next event. `None` means the server closed the connection.
    pub async fn next_event(&mut self) -> Result<Option<ChatEvent>, ChatError> {
        loop {
            let message = match self.reader.next::<ServerMessage>().await {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(None),
                Err(ChatError::MalformedMessage(reason)) => {
                    warn!("ignoring malformed frame: {reason}");
                    continue;
                }
                Err(error) => return Err(error),
            };
            if let Some(event) = self.decode(message) {
                return Ok(Some(event));
            }
        }
    }

    fn decode(&self, message: ServerMessage) -> Option<ChatEvent> {
        let kind = message.kind();
        let event = match message {
            ServerMessage::PublicMessage(Delivery { sender, content }) => {
                match open_text(&self.session_key, &content) {
                    Ok(text) => ChatEvent::Public { sender, text },
                    Err(_) => ChatEvent::Unreadable { sender, kind },
                }
            }
            ServerMessage::PrivateMessage(Delivery { sender, content }) => {
                match open_text(&self.session_key, &content) {
                    Ok(text) => ChatEvent::Private { sender, text },
                    Err(_) => ChatEvent::Unreadable { sender, kind },
                }
            }
            ServerMessage::PrivateMessageEcho(Echo { recipient, content }) => {
                match open_text(&self.session_key, &content) {
                    Ok(text) => ChatEvent::PrivateEcho { recipient, text },
                    Err(_) => ChatEvent::Unreadable {
                        sender: recipient,
                        kind: "private_message",
                    },
                }
            }
            ServerMessage::UserListUpdate(roster) => ChatEvent::Roster(roster.users),
            ServerMessage::FileTransfer(FileDelivery {
                sender,
                recipient,
                filename,
                content,
            }) => match BASE64.decode(content.trim()) {
                Ok(data) => ChatEvent::File {
                    sender,
                    recipient,
                    filename,
                    data,
                },
                Err(_) => ChatEvent::Unreadable { sender, kind },
            },
            other => {
                debug!(kind = other.kind(), "ignoring handshake message after setup");
                return None;
            }
        };
        Some(event)
    }
}

/// A connected, secured chat client.
pub struct ChatClient<R, W> {
    sender: ClientSender<W>,
    receiver: ClientReceiver<R>,
}

/// Client over TCP.
pub type TcpChatClient = ChatClient<OwnedReadHalf, OwnedWriteHalf>;

impl TcpChatClient {
    /// Connect to `config.server_addr` and run the handshake.
    pub async fn connect(config: &ClientConfig, identity: &KeyPair) -> Result<Self, ChatError> {
        let connection = TcpConnection::connect(&config.server_addr, config.max_frame_len).await?;
        Self::handshake(connection, identity).await
    }
}

impl<R, W> ChatClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Run the handshake over an already framed connection.
    pub async fn handshake(
        mut transport: Framed<R, W>,
        identity: &KeyPair,
    ) -> Result<Self, ChatError> {
        let session_key = initiate_handshake(&mut transport, identity).await?;
        let (reader, writer) = transport.into_parts();
        Ok(Self {
            sender: ClientSender {
                writer,
                session_key: session_key.clone(),
                nickname: None,
            },
            receiver: ClientReceiver {
                reader,
                session_key,
            },
        })
    }

    pub async fn login(&mut self, nickname: &str) -> Result<(), ChatError> {
        self.sender.login(nickname).await
    }

    pub fn nickname(&self) -> Option<&str> {
        self.sender.nickname()
    }

    pub async fn send_public(&mut self, text: &str) -> Result<(), ChatError> {
        self.sender.send_public(text).await
    }

    pub async fn send_private(&mut self, recipient: &str, text: &str) -> Result<(), ChatError> {
        self.sender.send_private(recipient, text).await
    }

    pub async fn send_file(
        &mut self,
        recipient: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<(), ChatError> {
        self.sender.send_file(recipient, filename, data).await
    }

    pub async fn next_event(&mut self) -> Result<Option<ChatEvent>, ChatError> {
        self.receiver.next_event().await
    }

    pub async fn close(&mut self) -> Result<(), ChatError> {
        self.sender.close().await
    }

    /// Split into independently usable halves.
    pub fn into_split(self) -> (ClientSender<W>, ClientReceiver<R>) {
        (self.sender, self.receiver)
    }
}
