//! Live connections, nicknames and message routing.
//!
//! The [`Registry`] is the only state shared between connection tasks. Its
//! lock is held to mutate or snapshot, never across a send: fan-out works on
//! a snapshot of handles, and each handle serializes its own writes.
//!
//! Chat content is sealed separately for every recipient under that
//! recipient's session key. A recipient whose write fails is dropped from the
//! registry (and told to disconnect), and everyone left gets a fresh roster.
//!
//! Roster updates go out one broadcast at a time, each built from the state
//! at the moment it is sent, so the last roster a client sees is current.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncWrite;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

use crate::chat::config::DEFAULT_MAX_FRAME_LEN;
use crate::chat::error::ChatError;
use crate::chat::protocol::{
    to_bytes, Delivery, Echo, FileDelivery, FileUpload, Roster, ServerMessage,
};
use crate::chat::transport::FrameWriter;
use crate::crypto::{seal, SessionKey};

/// File transfer recipient meaning "everyone but the sender".
pub const PUBLIC_RECIPIENT: &str = "public";

/// Server-assigned connection identifier.
pub type ConnectionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The router's view of one secured connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: String,
    session_key: SessionKey,
    writer: AsyncMutex<FrameWriter<BoxedWriter>>,
    evicted: Notify,
}

impl ConnectionHandle {
    pub fn new<W>(
        id: ConnectionId,
        peer_addr: impl Into<String>,
        session_key: SessionKey,
        writer: W,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer_addr: peer_addr.into(),
            session_key,
            writer: AsyncMutex::new(FrameWriter::new(Box::new(writer) as BoxedWriter)),
            evicted: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// Write one frame. Concurrent senders are serialized.
    pub async fn send(&self, message: &ServerMessage) -> Result<(), ChatError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(message)
            .await
            .map_err(|e| ChatError::SendFailure(e.to_string()))
    }

    /// Flush and close the write side.
    pub async fn shutdown(&self) {
        if let Err(error) = self.writer.lock().await.shutdown().await {
            debug!(peer = %self.peer_addr, "shutdown failed: {error}");
        }
    }

    /// Ask the owning task to disconnect.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    /// Resolves once [`evict`](Self::evict) has been called.
    pub async fn evicted(&self) {
        self.evicted.notified().await;
    }
}

struct LiveConnection {
    handle: Arc<ConnectionHandle>,
    nickname: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    live: HashMap<ConnectionId, LiveConnection>,
    nicknames: BTreeMap<String, ConnectionId>,
}

impl RegistryState {
    fn remove(&mut self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.live.remove(&id)?;
        if let Some(nickname) = removed.nickname {
            if self.nicknames.get(&nickname) == Some(&id) {
                self.nicknames.remove(&nickname);
            }
        }
        Some(removed.handle)
    }

    fn by_nickname(&self, nickname: &str) -> Option<Arc<ConnectionHandle>> {
        let id = self.nicknames.get(nickname)?;
        self.live.get(id).map(|conn| conn.handle.clone())
    }

    fn handles_except(&self, excluded: ConnectionId) -> Vec<Arc<ConnectionHandle>> {
        self.live
            .values()
            .filter(|conn| conn.handle.id() != excluded)
            .map(|conn| conn.handle.clone())
            .collect()
    }
}

/// Connection registry and router.
pub struct Registry {
    state: Mutex<RegistryState>,
    roster_gate: AsyncMutex<()>,
    max_frame_len: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to relay frames larger than `max_frame_len`, the limit peers
    /// read with.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            roster_gate: AsyncMutex::new(()),
            max_frame_len,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a freshly secured connection. It has no nickname yet.
    pub fn attach(&self, handle: Arc<ConnectionHandle>) {
        let id = handle.id();
        self.lock().live.insert(
            id,
            LiveConnection {
                handle,
                nickname: None,
            },
        );
    }

    /// Bind `nickname` to connection `id` and broadcast the new roster.
    ///
    /// A connection's previous nickname is released. If another connection
    /// held `nickname`, it is removed and told to disconnect.
    pub async fn register(&self, id: ConnectionId, nickname: &str) -> Result<(), ChatError> {
        let evicted = {
            let mut state = self.lock();
            let previous = match state.live.get(&id) {
                Some(conn) => conn.nickname.clone(),
                None => return Err(ChatError::ChannelNotReady),
            };
            if let Some(previous) = previous {
                if state.nicknames.get(&previous) == Some(&id) {
                    state.nicknames.remove(&previous);
                }
            }

            let evicted = match state.nicknames.insert(nickname.to_string(), id) {
                Some(holder) if holder != id => state.remove(holder),
                _ => None,
            };
            if let Some(conn) = state.live.get_mut(&id) {
                conn.nickname = Some(nickname.to_string());
            }
            evicted
        };

        if let Some(holder) = evicted {
            info!(peer = %holder.peer_addr(), %nickname, "nickname taken over, evicting previous holder");
            holder.evict();
        }
        info!(%nickname, connection = id, "registered");
        self.broadcast_roster().await;
        Ok(())
    }

    /// Remove connection `id`. Returns false if it was already gone.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(handle) => {
                info!(peer = %handle.peer_addr(), connection = id, "unregistered");
                self.broadcast_roster().await;
                true
            }
            None => false,
        }
    }

    /// Seal `plaintext` for every live connection except the sender.
    pub async fn broadcast_public(
        &self,
        sender: ConnectionId,
        sender_nickname: &str,
        plaintext: &str,
    ) -> Result<(), ChatError> {
        let targets = self.lock().handles_except(sender);
        let mut outgoing = Vec::with_capacity(targets.len());
        for target in targets {
            let content = seal(target.session_key(), plaintext.as_bytes())?;
            let message = ServerMessage::PublicMessage(Delivery {
                sender: sender_nickname.to_string(),
                content,
            });
            outgoing.push((target, message));
        }
        self.deliver(outgoing).await;
        Ok(())
    }

    /// Deliver a private message and echo it back to the sender.
    ///
    /// Nothing is sent at all when `recipient` is not registered.
    pub async fn route_direct(
        &self,
        sender: ConnectionId,
        sender_nickname: &str,
        recipient: &str,
        plaintext: &str,
    ) -> Result<(), ChatError> {
        let (target, origin) = {
            let state = self.lock();
            let origin = state.live.get(&sender).map(|conn| conn.handle.clone());
            (state.by_nickname(recipient), origin)
        };
        let target = target.ok_or_else(|| ChatError::RecipientUnavailable(recipient.to_string()))?;

        let mut outgoing = vec![(
            target.clone(),
            ServerMessage::PrivateMessage(Delivery {
                sender: sender_nickname.to_string(),
                content: seal(target.session_key(), plaintext.as_bytes())?,
            }),
        )];
        if let Some(origin) = origin {
            let content = seal(origin.session_key(), plaintext.as_bytes())?;
            outgoing.push((
                origin,
                ServerMessage::PrivateMessageEcho(Echo {
                    recipient: recipient.to_string(),
                    content,
                }),
            ));
        }
        self.deliver(outgoing).await;
        Ok(())
    }

    /// Send the sorted nickname list to every live connection.
    pub async fn broadcast_roster(&self) {
        let _gate = self.roster_gate.lock().await;
        loop {
            let outgoing = self.roster_messages();
            if !self.send_all(outgoing).await {
                return;
            }
        }
    }

    /// Forward a file to one nickname, or to everyone but the sender when
    /// the recipient is [`PUBLIC_RECIPIENT`]. The content is not re-encrypted.
    ///
    /// The relayed frame carries the sender's nickname on top of the upload;
    /// if that pushes it past the frame limit the file is refused with
    /// [`ChatError::FrameTooLarge`] and nobody receives it.
    pub async fn relay_file(
        &self,
        sender: ConnectionId,
        sender_nickname: &str,
        upload: FileUpload,
    ) -> Result<(), ChatError> {
        let targets = {
            let state = self.lock();
            if upload.recipient == PUBLIC_RECIPIENT {
                state.handles_except(sender)
            } else {
                state.by_nickname(&upload.recipient).into_iter().collect()
            }
        };
        if targets.is_empty() && upload.recipient != PUBLIC_RECIPIENT {
            return Err(ChatError::RecipientUnavailable(upload.recipient));
        }

        let message = ServerMessage::FileTransfer(FileDelivery {
            sender: sender_nickname.to_string(),
            recipient: upload.recipient,
            filename: upload.filename,
            content: upload.content,
        });
        let len = to_bytes(&message)?.len();
        if len > self.max_frame_len {
            return Err(ChatError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let outgoing = targets
            .into_iter()
            .map(|target| (target, message.clone()))
            .collect();
        self.deliver(outgoing).await;
        Ok(())
    }

    /// Registered nicknames, sorted.
    pub fn roster(&self) -> Vec<String> {
        self.lock().nicknames.keys().cloned().collect()
    }

    /// Number of live connections, named or not.
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    fn roster_messages(&self) -> Vec<(Arc<ConnectionHandle>, ServerMessage)> {
        let state = self.lock();
        let roster = ServerMessage::UserListUpdate(Roster {
            users: state.nicknames.keys().cloned().collect(),
        });
        state
            .live
            .values()
            .map(|conn| (conn.handle.clone(), roster.clone()))
            .collect()
    }

    /// Send every message; connections that fail are dropped, which in turn
    /// sends a new roster to the rest.
    async fn deliver(&self, outgoing: Vec<(Arc<ConnectionHandle>, ServerMessage)>) {
        if self.send_all(outgoing).await {
            self.broadcast_roster().await;
        }
    }

    /// Returns true if a failing connection was dropped.
    async fn send_all(&self, outgoing: Vec<(Arc<ConnectionHandle>, ServerMessage)>) -> bool {
        let mut failed = Vec::new();
        for (target, message) in &outgoing {
            if let Err(error) = target.send(message).await {
                warn!(peer = %target.peer_addr(), kind = message.kind(), "dropping connection: {error}");
                failed.push(target.id());
            }
        }

        let mut dropped = false;
        for id in failed {
            let removed = self.lock().remove(id);
            if let Some(handle) = removed {
                handle.evict();
                dropped = true;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::transport::FrameReader;
    use crate::crypto::open_text;
    use tokio::io::DuplexStream;

    struct Peer {
        handle: Arc<ConnectionHandle>,
        inbox: FrameReader<DuplexStream>,
        key: SessionKey,
    }

    impl Peer {
        fn new(id: ConnectionId) -> Self {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let key = SessionKey::generate();
            let handle = Arc::new(ConnectionHandle::new(
                id,
                format!("127.0.0.1:{}", 40000 + id),
                key.clone(),
                ours,
            ));
            Self {
                handle,
                inbox: FrameReader::new(theirs),
                key,
            }
        }

        async fn recv(&mut self) -> ServerMessage {
            self.inbox.next().await.unwrap().unwrap()
        }

        async fn expect_roster(&mut self) -> Vec<String> {
            match self.recv().await {
                ServerMessage::UserListUpdate(roster) => roster.users,
                other => panic!("expected roster, got {}", other.kind()),
            }
        }
    }

    async fn named(registry: &Registry, id: ConnectionId, nickname: &str) -> Peer {
        let peer = Peer::new(id);
        registry.attach(peer.handle.clone());
        registry.register(id, nickname).await.unwrap();
        peer
    }

    async fn alice_and_bob(registry: &Registry) -> (Peer, Peer) {
        let mut alice = named(registry, 1, "alice").await;
        let mut bob = named(registry, 2, "bob").await;
        assert_eq!(alice.expect_roster().await, vec!["alice"]);
        assert_eq!(alice.expect_roster().await, vec!["alice", "bob"]);
        assert_eq!(bob.expect_roster().await, vec!["alice", "bob"]);
        (alice, bob)
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let registry = Registry::new();
        let (mut alice, mut bob) = alice_and_bob(&registry).await;

        registry.broadcast_public(1, "alice", "hi").await.unwrap();

        match bob.recv().await {
            ServerMessage::PublicMessage(delivery) => {
                assert_eq!(delivery.sender, "alice");
                assert_eq!(open_text(&bob.key, &delivery.content).unwrap(), "hi");
            }
            other => panic!("unexpected {}", other.kind()),
        }

        // Alice's next frame is the roster, so the broadcast never reached her.
        registry.broadcast_roster().await;
        assert_eq!(alice.expect_roster().await, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_ciphertexts_differ_per_recipient() {
        let registry = Registry::new();
        let (mut alice, mut bob) = alice_and_bob(&registry).await;
        let mut carol = named(&registry, 3, "carol").await;
        alice.expect_roster().await;
        bob.expect_roster().await;
        carol.expect_roster().await;

        registry.broadcast_public(1, "alice", "same words").await.unwrap();
        let ServerMessage::PublicMessage(to_bob) = bob.recv().await else {
            panic!("expected public_message");
        };
        let ServerMessage::PublicMessage(to_carol) = carol.recv().await else {
            panic!("expected public_message");
        };
        assert_ne!(to_bob.content, to_carol.content);
        assert!(open_text(&carol.key, &to_bob.content).is_err());
        assert_eq!(open_text(&carol.key, &to_carol.content).unwrap(), "same words");
    }

    #[tokio::test]
    async fn test_route_direct_with_echo() {
        let registry = Registry::new();
        let (mut alice, mut bob) = alice_and_bob(&registry).await;

        registry.route_direct(1, "alice", "bob", "secret").await.unwrap();

        match bob.recv().await {
            ServerMessage::PrivateMessage(delivery) => {
                assert_eq!(delivery.sender, "alice");
                assert_eq!(open_text(&bob.key, &delivery.content).unwrap(), "secret");
            }
            other => panic!("unexpected {}", other.kind()),
        }
        match alice.recv().await {
            ServerMessage::PrivateMessageEcho(echo) => {
                assert_eq!(echo.recipient, "bob");
                assert_eq!(open_text(&alice.key, &echo.content).unwrap(), "secret");
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_route_direct_to_absent_sends_nothing() {
        let registry = Registry::new();
        let (mut alice, mut bob) = alice_and_bob(&registry).await;

        let result = registry.route_direct(1, "alice", "dave", "anyone?").await;
        assert!(matches!(result, Err(ChatError::RecipientUnavailable(name)) if name == "dave"));

        registry.broadcast_roster().await;
        alice.expect_roster().await;
        bob.expect_roster().await;
    }

    #[tokio::test]
    async fn test_unregister_broadcasts_once() {
        let registry = Registry::new();
        let (mut alice, _bob) = alice_and_bob(&registry).await;

        assert!(registry.unregister(2).await);
        assert_eq!(alice.expect_roster().await, vec!["alice"]);
        assert_eq!(registry.roster(), vec!["alice"]);

        assert!(!registry.unregister(2).await);
        registry.route_direct(1, "alice", "alice", "note").await.unwrap();
        assert!(matches!(alice.recv().await, ServerMessage::PrivateMessage(_)));
    }

    #[tokio::test]
    async fn test_nickname_takeover_evicts_holder() {
        let registry = Registry::new();
        let old = named(&registry, 1, "alice").await;
        let mut new = named(&registry, 2, "alice").await;

        old.handle.evicted().await;
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.roster(), vec!["alice"]);
        assert_eq!(new.expect_roster().await, vec!["alice"]);

        // The evicted holder's own cleanup is a no-op.
        assert!(!registry.unregister(1).await);
    }

    #[tokio::test]
    async fn test_rename_releases_old_nickname() {
        let registry = Registry::new();
        let mut alice = named(&registry, 1, "alice").await;
        alice.expect_roster().await;

        registry.register(1, "alicia").await.unwrap();
        assert_eq!(alice.expect_roster().await, vec!["alicia"]);
    }

    #[tokio::test]
    async fn test_register_unknown_connection() {
        let registry = Registry::new();
        let result = registry.register(9, "ghost").await;
        assert!(matches!(result, Err(ChatError::ChannelNotReady)));
    }

    #[tokio::test]
    async fn test_failed_send_drops_only_that_connection() {
        let registry = Registry::new();
        let (mut alice, bob) = alice_and_bob(&registry).await;
        let mut carol = named(&registry, 3, "carol").await;
        alice.expect_roster().await;
        carol.expect_roster().await;
        let bob_handle = bob.handle.clone();
        drop(bob);

        registry.broadcast_public(1, "alice", "hello?").await.unwrap();

        // Bob's failure does not stop carol's copy.
        match carol.recv().await {
            ServerMessage::PublicMessage(delivery) => {
                assert_eq!(delivery.sender, "alice");
                assert_eq!(open_text(&carol.key, &delivery.content).unwrap(), "hello?");
            }
            other => panic!("unexpected {}", other.kind()),
        }
        assert_eq!(carol.expect_roster().await, vec!["alice", "carol"]);

        bob_handle.evicted().await;
        assert_eq!(alice.expect_roster().await, vec!["alice", "carol"]);
        assert_eq!(registry.live_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_last_roster_matches_final_state() {
        let registry = Arc::new(Registry::new());
        let mut observer = Peer::new(100);
        registry.attach(observer.handle.clone());

        // Keep the peers alive so none of their sends fail.
        let peers: Vec<Peer> = (1..=8).map(Peer::new).collect();
        for peer in &peers {
            registry.attach(peer.handle.clone());
        }

        let tasks: Vec<_> = (1..=8u64)
            .map(|id| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.register(id, &format!("user{}", id)).await.unwrap();
                    if id % 2 == 0 {
                        assert!(registry.unregister(id).await);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // 8 logins and 4 departures, one roster each.
        let mut last = Vec::new();
        for _ in 0..12 {
            last = observer.expect_roster().await;
        }
        assert_eq!(last, registry.roster());
        assert_eq!(last, vec!["user1", "user3", "user5", "user7"]);
    }

    #[tokio::test]
    async fn test_relay_file() {
        let registry = Registry::new();
        let (mut alice, mut bob) = alice_and_bob(&registry).await;

        let upload = FileUpload {
            recipient: PUBLIC_RECIPIENT.to_string(),
            filename: "notes.txt".to_string(),
            content: "aGVsbG8=".to_string(),
        };
        registry.relay_file(1, "alice", upload).await.unwrap();
        match bob.recv().await {
            ServerMessage::FileTransfer(file) => {
                assert_eq!(file.sender, "alice");
                assert_eq!(file.recipient, "public");
                assert_eq!(file.content, "aGVsbG8=");
            }
            other => panic!("unexpected {}", other.kind()),
        }

        let upload = FileUpload {
            recipient: "alice".to_string(),
            filename: "reply.txt".to_string(),
            content: "b2s=".to_string(),
        };
        registry.relay_file(2, "bob", upload).await.unwrap();
        assert!(matches!(alice.recv().await, ServerMessage::FileTransfer(_)));

        let upload = FileUpload {
            recipient: "dave".to_string(),
            filename: "lost.txt".to_string(),
            content: "".to_string(),
        };
        let result = registry.relay_file(1, "alice", upload).await;
        assert!(matches!(result, Err(ChatError::RecipientUnavailable(_))));
    }

    #[tokio::test]
    async fn test_relay_file_respects_frame_limit() {
        let registry = Registry::with_max_frame_len(256);
        let mut alice = named(&registry, 1, "alice").await;
        let mut bob = named(&registry, 2, "bob").await;
        alice.expect_roster().await;
        alice.expect_roster().await;
        bob.expect_roster().await;

        let upload = FileUpload {
            recipient: "bob".to_string(),
            filename: "big.bin".to_string(),
            content: "A".repeat(200),
        };
        let result = registry.relay_file(1, "alice", upload).await;
        assert!(matches!(
            result,
            Err(ChatError::FrameTooLarge { max: 256, .. })
        ));

        // Nothing was queued for bob.
        registry.broadcast_roster().await;
        assert_eq!(bob.expect_roster().await, vec!["alice", "bob"]);
        assert_eq!(registry.live_count(), 2);
    }
}
