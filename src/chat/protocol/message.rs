//! Wire message types for the chat protocol.
//!
//! Every frame carries a JSON envelope `{"type": ..., "payload": {...}}`.
//! Messages are split by direction: [`ClientMessage`] is what a client may
//! send, [`ServerMessage`] is what a server may send. Payload structs reject
//! unknown fields, so a malformed envelope fails at decode time.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::chat::error::ChatError;
use crate::crypto::SealedPayload;

/// Payload of messages that carry nothing (`auth_success`, `auth_fail`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Empty {}

/// `client_public_key` / `server_public_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublicKeyAnnouncement {
    /// SPKI PEM text.
    pub public_key: String,
}

/// `otp_challenge`: Base64 RSA-OAEP ciphertext of the challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtpChallenge {
    pub challenge: String,
}

/// `otp_response`: the challenge re-encrypted for the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtpResponse {
    pub response: String,
}

/// `aes_key_exchange`: Base64 RSA-OAEP ciphertext of the 32-byte session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionKeyDelivery {
    pub key: String,
}

/// `login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Login {
    pub nickname: String,
}

/// Client-to-server `public_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublicPost {
    pub content: SealedPayload,
}

/// Client-to-server `private_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrivatePost {
    pub recipient: String,
    pub content: SealedPayload,
}

/// Client-to-server `file_transfer`. `content` is Base64 of the raw file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileUpload {
    pub recipient: String,
    pub filename: String,
    pub content: String,
}

/// Server-to-client `public_message` and `private_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delivery {
    pub sender: String,
    pub content: SealedPayload,
}

/// Server-to-client `private_message_echo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Echo {
    pub recipient: String,
    pub content: SealedPayload,
}

/// Server-to-client `user_list_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Roster {
    pub users: Vec<String>,
}

/// Server-to-client `file_transfer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileDelivery {
    pub sender: String,
    pub recipient: String,
    pub filename: String,
    pub content: String,
}

/// Messages a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case", deny_unknown_fields)]
pub enum ClientMessage {
    ClientPublicKey(PublicKeyAnnouncement),
    OtpResponse(OtpResponse),
    AesKeyExchange(SessionKeyDelivery),
    Login(Login),
    PublicMessage(PublicPost),
    PrivateMessage(PrivatePost),
    FileTransfer(FileUpload),
}

impl ClientMessage {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::ClientPublicKey(_) => "client_public_key",
            ClientMessage::OtpResponse(_) => "otp_response",
            ClientMessage::AesKeyExchange(_) => "aes_key_exchange",
            ClientMessage::Login(_) => "login",
            ClientMessage::PublicMessage(_) => "public_message",
            ClientMessage::PrivateMessage(_) => "private_message",
            ClientMessage::FileTransfer(_) => "file_transfer",
        }
    }
}

/// Messages a server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case", deny_unknown_fields)]
pub enum ServerMessage {
    ServerPublicKey(PublicKeyAnnouncement),
    OtpChallenge(OtpChallenge),
    AuthSuccess(Empty),
    AuthFail(Empty),
    SecureChannelReady(Empty),
    PublicMessage(Delivery),
    PrivateMessage(Delivery),
    PrivateMessageEcho(Echo),
    UserListUpdate(Roster),
    FileTransfer(FileDelivery),
}

impl ServerMessage {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ServerPublicKey(_) => "server_public_key",
            ServerMessage::OtpChallenge(_) => "otp_challenge",
            ServerMessage::AuthSuccess(_) => "auth_success",
            ServerMessage::AuthFail(_) => "auth_fail",
            ServerMessage::SecureChannelReady(_) => "secure_channel_ready",
            ServerMessage::PublicMessage(_) => "public_message",
            ServerMessage::PrivateMessage(_) => "private_message",
            ServerMessage::PrivateMessageEcho(_) => "private_message_echo",
            ServerMessage::UserListUpdate(_) => "user_list_update",
            ServerMessage::FileTransfer(_) => "file_transfer",
        }
    }
}

/// Serialize a message envelope to JSON bytes (no length prefix).
pub fn to_bytes<M: Serialize>(message: &M) -> Result<Vec<u8>, ChatError> {
    serde_json::to_vec(message).map_err(|e| ChatError::MalformedMessage(e.to_string()))
}

/// Deserialize a message envelope from JSON bytes.
pub fn from_bytes<M: DeserializeOwned>(bytes: &[u8]) -> Result<M, ChatError> {
    serde_json::from_slice(bytes).map_err(|e| ChatError::MalformedMessage(e.to_string()))
}
