//! Chat error types.

use thiserror::Error;

use crate::chat::handshake::HandshakePhase;
use crate::crypto::{AsymmetricError, KeyError, SymmetricError};

/// Errors that can occur during chat operations.
#[derive(Error, Debug)]
pub enum ChatError {
    /// The peer closed the stream in the middle of a frame.
    #[error("Transport closed mid-frame")]
    TruncatedMessage,

    /// The peer closed the connection before the handshake finished.
    #[error("Peer disconnected")]
    Disconnected,

    /// A frame announced a body larger than we are willing to buffer.
    #[error("Frame too large: {len} bytes (max: {max})")]
    FrameTooLarge {
        /// Announced body length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The envelope did not parse into a known message.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A message arrived that the current handshake phase does not accept.
    #[error("Unexpected message '{got}' during {phase}")]
    UnexpectedMessageType {
        /// Phase the handshake was in.
        phase: HandshakePhase,
        /// Wire type of the offending message.
        got: String,
    },

    /// AEAD tag mismatch, or a handshake secret that failed to decrypt.
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    /// The peer answered the challenge with the wrong value.
    #[error("Challenge response rejected")]
    OtpRejected,

    /// The server answered our challenge response with `auth_fail`.
    #[error("Server rejected authentication")]
    AuthRejected,

    /// A public key or wrapped session key could not be decoded.
    #[error("Key decode failure: {0}")]
    KeyDecodeFailure(String),

    /// Login with a nickname that cannot be registered.
    #[error("Invalid nickname: '{0}'")]
    InvalidNickname(String),

    /// Direct message to a nickname nobody holds.
    #[error("Recipient unavailable: {0}")]
    RecipientUnavailable(String),

    /// Writing to a peer failed.
    #[error("Send failed: {0}")]
    SendFailure(String),

    /// The connection is not in a state that allows the operation.
    #[error("Secure channel not established")]
    ChannelNotReady,

    /// Local cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ChatError {
    /// True for errors after which the transport cannot be used any more.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChatError::TruncatedMessage
                | ChatError::Disconnected
                | ChatError::FrameTooLarge { .. }
                | ChatError::SendFailure(_)
                | ChatError::IoError(_)
        )
    }
}

impl From<KeyError> for ChatError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::GenerationFailed(msg) => ChatError::Crypto(msg),
            other => ChatError::KeyDecodeFailure(other.to_string()),
        }
    }
}

impl From<SymmetricError> for ChatError {
    fn from(err: SymmetricError) -> Self {
        match err {
            SymmetricError::EncryptionFailed => ChatError::Crypto(err.to_string()),
            SymmetricError::AuthenticationFailure(msg) => ChatError::AuthenticationFailure(msg),
            SymmetricError::InvalidKeyLength(_) => ChatError::KeyDecodeFailure(err.to_string()),
        }
    }
}

impl From<AsymmetricError> for ChatError {
    fn from(err: AsymmetricError) -> Self {
        match err {
            AsymmetricError::EncryptionFailed(msg) => ChatError::Crypto(msg),
            AsymmetricError::DecryptionFailed(msg) => ChatError::AuthenticationFailure(msg),
            AsymmetricError::Base64Error(e) => ChatError::KeyDecodeFailure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(ChatError::TruncatedMessage.is_transport());
        assert!(ChatError::SendFailure("broken pipe".into()).is_transport());
        assert!(!ChatError::AuthenticationFailure("tag".into()).is_transport());
        assert!(!ChatError::RecipientUnavailable("bob".into()).is_transport());
    }

    #[test]
    fn test_symmetric_error_mapping() {
        let err: ChatError = SymmetricError::AuthenticationFailure("tag mismatch".into()).into();
        assert!(matches!(err, ChatError::AuthenticationFailure(_)));

        let err: ChatError = SymmetricError::InvalidKeyLength(5).into();
        assert!(matches!(err, ChatError::KeyDecodeFailure(_)));
    }

    #[test]
    fn test_unexpected_message_display() {
        let err = ChatError::UnexpectedMessageType {
            phase: HandshakePhase::AwaitingPeerPublicKey,
            got: "login".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unexpected message 'login' during AwaitingPeerPublicKey"
        );
    }
}
