//! Connection handshake: key exchange, challenge-response, session key.
//!
//! ## Flow
//!
//! 1. Client sends `client_public_key`, server answers `server_public_key`
//!    followed by `otp_challenge` (a 6-digit code encrypted to the client).
//! 2. Client decrypts the code and returns it encrypted to the server in
//!    `otp_response`. The server answers `auth_success` or `auth_fail`.
//! 3. Client generates a 32-byte session key and sends it encrypted to the
//!    server in `aes_key_exchange`. The server answers `secure_channel_ready`.
//!
//! Both sides are plain state machines ([`ServerHandshake`],
//! [`ClientHandshake`]) fed one message at a time; [`accept_handshake`] and
//! [`initiate_handshake`] drive them over a [`MessageTransport`]. Any
//! out-of-order or malformed step moves the machine to `Failed` for good.

use std::fmt;
use std::mem;

use rsa::RsaPublicKey;
use tracing::{debug, warn};

use crate::chat::error::ChatError;
use crate::chat::protocol::{
    ClientMessage, Empty, OtpChallenge, OtpResponse, PublicKeyAnnouncement, ServerMessage,
    SessionKeyDelivery,
};
use crate::chat::transport::MessageTransport;
use crate::crypto::{
    decode_public_key_pem, decrypt_from_base64, encrypt_to_base64, Challenge, KeyPair, SessionKey,
};

/// Handshake progress, as reported in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    AwaitingPeerPublicKey,
    KeysExchanged,
    ChallengeIssued,
    Authenticated,
    SessionKeyPending,
    SecureChannelReady,
    Failed,
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Server-side handshake state. Each phase carries what it has learned so far.
#[derive(Debug)]
pub enum HandshakeState {
    AwaitingPeerPublicKey,
    KeysExchanged {
        peer_key: RsaPublicKey,
    },
    ChallengeIssued {
        peer_key: RsaPublicKey,
        challenge: Challenge,
    },
    Authenticated {
        peer_key: RsaPublicKey,
    },
    SessionKeyPending {
        peer_key: RsaPublicKey,
    },
    SecureChannelReady {
        peer_key: RsaPublicKey,
        session_key: SessionKey,
    },
    Failed,
}

impl HandshakeState {
    pub fn phase(&self) -> HandshakePhase {
        match self {
            HandshakeState::AwaitingPeerPublicKey => HandshakePhase::AwaitingPeerPublicKey,
            HandshakeState::KeysExchanged { .. } => HandshakePhase::KeysExchanged,
            HandshakeState::ChallengeIssued { .. } => HandshakePhase::ChallengeIssued,
            HandshakeState::Authenticated { .. } => HandshakePhase::Authenticated,
            HandshakeState::SessionKeyPending { .. } => HandshakePhase::SessionKeyPending,
            HandshakeState::SecureChannelReady { .. } => HandshakePhase::SecureChannelReady,
            HandshakeState::Failed => HandshakePhase::Failed,
        }
    }
}

/// Result of a completed handshake.
#[derive(Debug)]
pub struct SecuredSession {
    /// The peer's RSA public key.
    pub peer_key: RsaPublicKey,
    /// Shared AES-256-GCM key for the rest of the connection.
    pub session_key: SessionKey,
}

/// Server side of the handshake.
pub struct ServerHandshake<'a> {
    identity: &'a KeyPair,
    state: HandshakeState,
}

impl<'a> ServerHandshake<'a> {
    pub fn new(identity: &'a KeyPair) -> Self {
        Self {
            identity,
            state: HandshakeState::AwaitingPeerPublicKey,
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.state.phase()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, HandshakeState::SecureChannelReady { .. })
    }

    /// Feed one client message. Returns the replies to send, in order.
    ///
    /// On error the machine is left in `Failed`.
    pub fn handle(&mut self, message: ClientMessage) -> Result<Vec<ServerMessage>, ChatError> {
        let state = mem::replace(&mut self.state, HandshakeState::Failed);
        let (next, mut replies) = self.step(state, message)?;

        // Transient phases move on without waiting for the client.
        self.state = match next {
            HandshakeState::KeysExchanged { peer_key } => {
                let (next, challenge) = self.issue_challenge(peer_key)?;
                replies.push(challenge);
                next
            }
            HandshakeState::Authenticated { peer_key } => {
                HandshakeState::SessionKeyPending { peer_key }
            }
            other => other,
        };
        Ok(replies)
    }

    fn step(
        &self,
        state: HandshakeState,
        message: ClientMessage,
    ) -> Result<(HandshakeState, Vec<ServerMessage>), ChatError> {
        match (state, message) {
            (HandshakeState::AwaitingPeerPublicKey, ClientMessage::ClientPublicKey(announce)) => {
                let peer_key = decode_public_key_pem(&announce.public_key)?;
                let announce = ServerMessage::ServerPublicKey(PublicKeyAnnouncement {
                    public_key: self.identity.public_key_pem().to_string(),
                });
                Ok((HandshakeState::KeysExchanged { peer_key }, vec![announce]))
            }

            (
                HandshakeState::ChallengeIssued {
                    peer_key,
                    challenge,
                },
                ClientMessage::OtpResponse(OtpResponse { response }),
            ) => {
                let answer = decrypt_from_base64(&response, self.identity.private_key())
                    .map_err(|_| ChatError::OtpRejected)?;
                if !challenge.verify(&answer) {
                    return Err(ChatError::OtpRejected);
                }
                Ok((
                    HandshakeState::Authenticated { peer_key },
                    vec![ServerMessage::AuthSuccess(Empty {})],
                ))
            }

            (
                HandshakeState::SessionKeyPending { peer_key },
                ClientMessage::AesKeyExchange(SessionKeyDelivery { key }),
            ) => {
                let raw = decrypt_from_base64(&key, self.identity.private_key())
                    .map_err(|e| ChatError::KeyDecodeFailure(e.to_string()))?;
                let session_key = SessionKey::from_slice(&raw)?;
                Ok((
                    HandshakeState::SecureChannelReady {
                        peer_key,
                        session_key,
                    },
                    vec![ServerMessage::SecureChannelReady(Empty {})],
                ))
            }

            (state, message) => Err(ChatError::UnexpectedMessageType {
                phase: state.phase(),
                got: message.kind().to_string(),
            }),
        }
    }

    fn issue_challenge(
        &self,
        peer_key: RsaPublicKey,
    ) -> Result<(HandshakeState, ServerMessage), ChatError> {
        let challenge = Challenge::generate();
        let encrypted = encrypt_to_base64(challenge.as_str().as_bytes(), &peer_key)?;
        Ok((
            HandshakeState::ChallengeIssued {
                peer_key,
                challenge,
            },
            ServerMessage::OtpChallenge(OtpChallenge {
                challenge: encrypted,
            }),
        ))
    }

    /// Consume a finished handshake.
    pub fn into_session(self) -> Result<SecuredSession, ChatError> {
        match self.state {
            HandshakeState::SecureChannelReady {
                peer_key,
                session_key,
            } => Ok(SecuredSession {
                peer_key,
                session_key,
            }),
            _ => Err(ChatError::ChannelNotReady),
        }
    }
}

enum ClientState {
    AwaitingPeerPublicKey,
    KeysExchanged { server_key: RsaPublicKey },
    ChallengeAnswered { server_key: RsaPublicKey },
    SessionKeyPending { session_key: SessionKey },
    SecureChannelReady { session_key: SessionKey },
    Failed,
}

impl ClientState {
    fn phase(&self) -> HandshakePhase {
        match self {
            ClientState::AwaitingPeerPublicKey => HandshakePhase::AwaitingPeerPublicKey,
            ClientState::KeysExchanged { .. } => HandshakePhase::KeysExchanged,
            ClientState::ChallengeAnswered { .. } => HandshakePhase::ChallengeIssued,
            ClientState::SessionKeyPending { .. } => HandshakePhase::SessionKeyPending,
            ClientState::SecureChannelReady { .. } => HandshakePhase::SecureChannelReady,
            ClientState::Failed => HandshakePhase::Failed,
        }
    }
}

/// Client side of the handshake.
pub struct ClientHandshake<'a> {
    identity: &'a KeyPair,
    state: ClientState,
}

impl<'a> ClientHandshake<'a> {
    pub fn new(identity: &'a KeyPair) -> Self {
        Self {
            identity,
            state: ClientState::AwaitingPeerPublicKey,
        }
    }

    /// The opening message.
    pub fn start(&self) -> ClientMessage {
        ClientMessage::ClientPublicKey(PublicKeyAnnouncement {
            public_key: self.identity.public_key_pem().to_string(),
        })
    }

    pub fn phase(&self) -> HandshakePhase {
        self.state.phase()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ClientState::SecureChannelReady { .. })
    }

    /// Feed one server message. Returns the reply to send, if any.
    pub fn handle(&mut self, message: ServerMessage) -> Result<Option<ClientMessage>, ChatError> {
        let state = mem::replace(&mut self.state, ClientState::Failed);
        let (next, reply) = self.step(state, message)?;
        self.state = next;
        Ok(reply)
    }

    fn step(
        &self,
        state: ClientState,
        message: ServerMessage,
    ) -> Result<(ClientState, Option<ClientMessage>), ChatError> {
        match (state, message) {
            (ClientState::AwaitingPeerPublicKey, ServerMessage::ServerPublicKey(announce)) => {
                let server_key = decode_public_key_pem(&announce.public_key)?;
                Ok((ClientState::KeysExchanged { server_key }, None))
            }

            (ClientState::KeysExchanged { server_key }, ServerMessage::OtpChallenge(otp)) => {
                let code = decrypt_from_base64(&otp.challenge, self.identity.private_key())?;
                let response = encrypt_to_base64(&code, &server_key)?;
                Ok((
                    ClientState::ChallengeAnswered { server_key },
                    Some(ClientMessage::OtpResponse(OtpResponse { response })),
                ))
            }

            (ClientState::ChallengeAnswered { server_key }, ServerMessage::AuthSuccess(_)) => {
                let session_key = SessionKey::generate();
                let key = encrypt_to_base64(session_key.as_bytes(), &server_key)?;
                Ok((
                    ClientState::SessionKeyPending { session_key },
                    Some(ClientMessage::AesKeyExchange(SessionKeyDelivery { key })),
                ))
            }

            (ClientState::ChallengeAnswered { .. }, ServerMessage::AuthFail(_)) => {
                Err(ChatError::AuthRejected)
            }

            (
                ClientState::SessionKeyPending { session_key },
                ServerMessage::SecureChannelReady(_),
            ) => Ok((ClientState::SecureChannelReady { session_key }, None)),

            (state, message) => Err(ChatError::UnexpectedMessageType {
                phase: state.phase(),
                got: message.kind().to_string(),
            }),
        }
    }

    /// Consume a finished handshake and return the session key.
    pub fn into_session_key(self) -> Result<SessionKey, ChatError> {
        match self.state {
            ClientState::SecureChannelReady { session_key } => Ok(session_key),
            _ => Err(ChatError::ChannelNotReady),
        }
    }
}

/// Run the server side of the handshake over `transport`.
///
/// A wrong, malformed or missing challenge response is answered with
/// `auth_fail` before the error is returned. The caller closes the connection
/// on any error.
pub async fn accept_handshake<T: MessageTransport>(
    transport: &mut T,
    identity: &KeyPair,
) -> Result<SecuredSession, ChatError> {
    let peer = transport.peer_addr();
    let mut handshake = ServerHandshake::new(identity);

    while !handshake.is_ready() {
        let phase = handshake.phase();
        let outcome = match transport.receive::<ClientMessage>().await {
            Ok(Some(message)) => handshake.handle(message),
            Ok(None) => {
                warn!(%peer, %phase, "peer disconnected during handshake");
                return Err(ChatError::Disconnected);
            }
            Err(error) => Err(error),
        };

        match outcome {
            Ok(replies) => {
                for reply in &replies {
                    transport.send(reply).await?;
                }
            }
            Err(error) if rejects_challenge(phase, &error) => {
                warn!(%peer, %phase, "challenge response rejected: {error}");
                transport.send(&ServerMessage::AuthFail(Empty {})).await?;
                return Err(error);
            }
            Err(error) => {
                warn!(%peer, %phase, "handshake failed: {error}");
                return Err(error);
            }
        }
    }

    debug!(%peer, "secure channel ready");
    handshake.into_session()
}

/// Whether `error`, raised while in `phase`, means the challenge was not
/// answered correctly.
fn rejects_challenge(phase: HandshakePhase, error: &ChatError) -> bool {
    match error {
        ChatError::OtpRejected => true,
        ChatError::MalformedMessage(_) | ChatError::UnexpectedMessageType { .. } => {
            phase == HandshakePhase::ChallengeIssued
        }
        _ => false,
    }
}

/// Run the client side of the handshake over `transport`.
pub async fn initiate_handshake<T: MessageTransport>(
    transport: &mut T,
    identity: &KeyPair,
) -> Result<SessionKey, ChatError> {
    let mut handshake = ClientHandshake::new(identity);
    transport.send(&handshake.start()).await?;

    while !handshake.is_ready() {
        let message = transport
            .receive::<ServerMessage>()
            .await?
            .ok_or(ChatError::Disconnected)?;
        if let Some(reply) = handshake.handle(message)? {
            transport.send(&reply).await?;
        }
    }

    handshake.into_session_key()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::Login;
    use crate::chat::transport::Framed;
    use crate::crypto::keys::test_keys;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Pipe = Framed<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pipe() -> (Pipe, Pipe) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Framed::new(a_read, a_write, "client"),
            Framed::new(b_read, b_write, "server"),
        )
    }

    #[test]
    fn test_state_machines_agree() {
        let server_keys = test_keys::keypair(0);
        let client_keys = test_keys::keypair(1);
        let mut server = ServerHandshake::new(&server_keys);
        let mut client = ClientHandshake::new(&client_keys);

        let replies = server.handle(client.start()).unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].kind(), "server_public_key");
        assert_eq!(replies[1].kind(), "otp_challenge");
        assert_eq!(server.phase(), HandshakePhase::ChallengeIssued);

        let mut replies = replies.into_iter();
        assert!(client.handle(replies.next().unwrap()).unwrap().is_none());
        let response = client.handle(replies.next().unwrap()).unwrap().unwrap();

        let replies = server.handle(response).unwrap();
        assert_eq!(replies, vec![ServerMessage::AuthSuccess(Empty {})]);
        assert_eq!(server.phase(), HandshakePhase::SessionKeyPending);

        let key_exchange = client
            .handle(replies.into_iter().next().unwrap())
            .unwrap()
            .unwrap();
        let replies = server.handle(key_exchange).unwrap();
        assert_eq!(replies, vec![ServerMessage::SecureChannelReady(Empty {})]);

        client.handle(replies.into_iter().next().unwrap()).unwrap();
        assert!(client.is_ready());
        assert!(server.is_ready());

        let client_key = client.into_session_key().unwrap();
        let session = server.into_session().unwrap();
        assert_eq!(client_key, session.session_key);
        assert_eq!(&session.peer_key, client_keys.public_key());
    }

    #[test]
    fn test_login_before_key_exchange_fails() {
        let server_keys = test_keys::keypair(0);
        let mut server = ServerHandshake::new(&server_keys);

        let result = server.handle(ClientMessage::Login(Login {
            nickname: "mallory".to_string(),
        }));
        assert!(matches!(
            result,
            Err(ChatError::UnexpectedMessageType {
                phase: HandshakePhase::AwaitingPeerPublicKey,
                ..
            })
        ));
        assert_eq!(server.phase(), HandshakePhase::Failed);

        // Nothing moves a failed handshake forward again.
        let client_keys = test_keys::keypair(1);
        let client = ClientHandshake::new(&client_keys);
        assert!(server.handle(client.start()).is_err());
        assert!(server.into_session().is_err());
    }

    #[test]
    fn test_session_key_before_challenge_fails() {
        let server_keys = test_keys::keypair(0);
        let client_keys = test_keys::keypair(1);
        let mut server = ServerHandshake::new(&server_keys);
        let client = ClientHandshake::new(&client_keys);
        server.handle(client.start()).unwrap();

        let key = encrypt_to_base64(SessionKey::generate().as_bytes(), server_keys.public_key())
            .unwrap();
        let result = server.handle(ClientMessage::AesKeyExchange(SessionKeyDelivery { key }));
        assert!(matches!(
            result,
            Err(ChatError::UnexpectedMessageType {
                phase: HandshakePhase::ChallengeIssued,
                ..
            })
        ));
    }

    #[test]
    fn test_bad_public_key_fails() {
        let server_keys = test_keys::keypair(0);
        let mut server = ServerHandshake::new(&server_keys);
        let result = server.handle(ClientMessage::ClientPublicKey(PublicKeyAnnouncement {
            public_key: "-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----".to_string(),
        }));
        assert!(matches!(result, Err(ChatError::KeyDecodeFailure(_))));
    }

    #[test]
    fn test_short_session_key_rejected() {
        let server_keys = test_keys::keypair(0);
        let client_keys = test_keys::keypair(1);
        let mut server = ServerHandshake::new(&server_keys);
        let mut client = ClientHandshake::new(&client_keys);

        let mut replies = server.handle(client.start()).unwrap().into_iter();
        client.handle(replies.next().unwrap()).unwrap();
        let response = client.handle(replies.next().unwrap()).unwrap().unwrap();
        server.handle(response).unwrap();

        let key = encrypt_to_base64(&[7u8; 16], server_keys.public_key()).unwrap();
        let result = server.handle(ClientMessage::AesKeyExchange(SessionKeyDelivery { key }));
        assert!(matches!(result, Err(ChatError::KeyDecodeFailure(_))));
    }

    #[test]
    fn test_client_rejects_auth_fail() {
        let server_keys = test_keys::keypair(0);
        let client_keys = test_keys::keypair(1);
        let mut server = ServerHandshake::new(&server_keys);
        let mut client = ClientHandshake::new(&client_keys);

        let mut replies = server.handle(client.start()).unwrap().into_iter();
        client.handle(replies.next().unwrap()).unwrap();
        client.handle(replies.next().unwrap()).unwrap();

        let result = client.handle(ServerMessage::AuthFail(Empty {}));
        assert!(matches!(result, Err(ChatError::AuthRejected)));
        assert_eq!(client.phase(), HandshakePhase::Failed);
    }

    #[tokio::test]
    async fn test_handshake_over_transport() {
        let (mut client_end, mut server_end) = pipe();
        let server_keys = test_keys::keypair(0);
        let client_keys = test_keys::keypair(1);

        let server_task = tokio::spawn(async move {
            accept_handshake(&mut server_end, &server_keys).await
        });
        let client_key = initiate_handshake(&mut client_end, &client_keys)
            .await
            .unwrap();
        let session = server_task.await.unwrap().unwrap();

        assert_eq!(client_key, session.session_key);
    }

    #[tokio::test]
    async fn test_wrong_otp_gets_auth_fail() {
        let (mut client_end, mut server_end) = pipe();
        let server_keys = test_keys::keypair(0);
        let client_keys = test_keys::keypair(1);

        let server_task = tokio::spawn(async move {
            let result = accept_handshake(&mut server_end, &server_keys).await;
            server_end.close().await.unwrap();
            result
        });

        let client = ClientHandshake::new(&client_keys);
        client_end.send(&client.start()).await.unwrap();

        let announce: ServerMessage = client_end.receive().await.unwrap().unwrap();
        let ServerMessage::ServerPublicKey(announce) = announce else {
            panic!("expected server_public_key");
        };
        let server_key = decode_public_key_pem(&announce.public_key).unwrap();
        let challenge: ServerMessage = client_end.receive().await.unwrap().unwrap();
        assert_eq!(challenge.kind(), "otp_challenge");

        let response = encrypt_to_base64(b"wrong!", &server_key).unwrap();
        client_end
            .send(&ClientMessage::OtpResponse(OtpResponse { response }))
            .await
            .unwrap();

        let verdict: ServerMessage = client_end.receive().await.unwrap().unwrap();
        assert_eq!(verdict, ServerMessage::AuthFail(Empty {}));
        assert!(client_end.receive::<ServerMessage>().await.unwrap().is_none());

        assert!(matches!(
            server_task.await.unwrap(),
            Err(ChatError::OtpRejected)
        ));
    }

    /// Run up to the challenge, answer with `answer`, and collect the
    /// server's verdict and result.
    async fn answer_challenge_with(
        answer: serde_json::Value,
    ) -> (ServerMessage, Result<SecuredSession, ChatError>) {
        let (mut client_end, mut server_end) = pipe();
        let server_keys = test_keys::keypair(0);
        let client_keys = test_keys::keypair(1);

        let server_task = tokio::spawn(async move {
            let result = accept_handshake(&mut server_end, &server_keys).await;
            server_end.close().await.unwrap();
            result
        });

        let client = ClientHandshake::new(&client_keys);
        client_end.send(&client.start()).await.unwrap();
        let announce: ServerMessage = client_end.receive().await.unwrap().unwrap();
        assert_eq!(announce.kind(), "server_public_key");
        let challenge: ServerMessage = client_end.receive().await.unwrap().unwrap();
        assert_eq!(challenge.kind(), "otp_challenge");

        client_end.send(&answer).await.unwrap();
        let verdict: ServerMessage = client_end.receive().await.unwrap().unwrap();
        assert!(client_end.receive::<ServerMessage>().await.unwrap().is_none());
        (verdict, server_task.await.unwrap())
    }

    #[tokio::test]
    async fn test_malformed_otp_response_gets_auth_fail() {
        let (verdict, result) = answer_challenge_with(serde_json::json!({
            "type": "otp_response",
            "payload": {"response": 123}
        }))
        .await;
        assert_eq!(verdict, ServerMessage::AuthFail(Empty {}));
        assert!(matches!(result, Err(ChatError::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn test_other_message_instead_of_otp_gets_auth_fail() {
        let (verdict, result) = answer_challenge_with(serde_json::json!({
            "type": "login",
            "payload": {"nickname": "alice"}
        }))
        .await;
        assert_eq!(verdict, ServerMessage::AuthFail(Empty {}));
        assert!(matches!(
            result,
            Err(ChatError::UnexpectedMessageType {
                phase: HandshakePhase::ChallengeIssued,
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_challenge_only_while_challenged() {
        let malformed = ChatError::MalformedMessage("bad".to_string());
        assert!(rejects_challenge(HandshakePhase::ChallengeIssued, &malformed));
        assert!(!rejects_challenge(HandshakePhase::AwaitingPeerPublicKey, &malformed));
        assert!(!rejects_challenge(HandshakePhase::SessionKeyPending, &malformed));
        assert!(rejects_challenge(HandshakePhase::ChallengeIssued, &ChatError::OtpRejected));
        assert!(!rejects_challenge(HandshakePhase::ChallengeIssued, &ChatError::Disconnected));
    }

    #[tokio::test]
    async fn test_disconnect_mid_handshake() {
        let (mut client_end, mut server_end) = pipe();
        let server_keys = test_keys::keypair(0);
        let client_keys = test_keys::keypair(1);

        let client = ClientHandshake::new(&client_keys);
        client_end.send(&client.start()).await.unwrap();
        client_end.close().await.unwrap();

        let result = accept_handshake(&mut server_end, &server_keys).await;
        assert!(matches!(result, Err(ChatError::Disconnected)));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(
            HandshakePhase::AwaitingPeerPublicKey.to_string(),
            "AwaitingPeerPublicKey"
        );
        assert_eq!(HandshakePhase::SecureChannelReady.to_string(), "SecureChannelReady");
    }
}
