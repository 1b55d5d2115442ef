//! Conversation history kept by the client.
//!
//! [`Transcript`] keeps lines in memory. [`FileTranscript`] also writes each
//! conversation to its own file, sealed with a local AES-256-GCM key, and
//! reads them back when opened.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use crate::chat::client::ChatEvent;
use crate::chat::error::ChatError;
use crate::chat::protocol::{from_bytes, to_bytes};
use crate::crypto::{open, seal, SealedPayload, SessionKey};

/// File holding the key that seals stored conversations.
pub const HISTORY_KEY_FILE: &str = "history.key";

const LOG_SUFFIX: &str = ".json.enc";

/// Who wrote a line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum LineAuthor {
    /// The local user.
    You,
    /// Another user.
    Peer(String),
    /// Client notices (files, unreadable messages).
    System,
}

/// One displayed line of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    pub author: LineAuthor,
    pub content: String,
    /// Unix timestamp when received or sent.
    pub timestamp: u64,
}

impl ChatLine {
    pub fn new(author: LineAuthor, content: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            author,
            content: content.into(),
            timestamp,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LineAuthor::System, content)
    }

    pub fn from_you(content: impl Into<String>) -> Self {
        Self::new(LineAuthor::You, content)
    }

    pub fn from_peer(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(LineAuthor::Peer(name.into()), content)
    }

    /// Turn an event into a line, as seen by `me`. Roster updates have none.
    pub fn from_event(event: &ChatEvent, me: &str) -> Option<Self> {
        let line = match event {
            ChatEvent::Public { sender, text } | ChatEvent::Private { sender, text } => {
                Self::from_peer(sender, text)
            }
            ChatEvent::PrivateEcho { text, .. } => Self::from_you(text),
            ChatEvent::Roster(_) => return None,
            ChatEvent::File {
                sender,
                filename,
                data,
                ..
            } => {
                let who = if sender == me { "you" } else { sender.as_str() };
                Self::system(format!("{} sent file '{}' ({} bytes)", who, filename, data.len()))
            }
            ChatEvent::Unreadable { sender, .. } => {
                Self::system(format!("[corrupt message from {}]", sender))
            }
        };
        Some(line)
    }

    /// Format the timestamp as HH:MM (UTC).
    pub fn formatted_time(&self) -> String {
        let secs = self.timestamp % 86400;
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        format!("{:02}:{:02}", hours, minutes)
    }
}

/// Ordered per-contact history.
pub trait ConversationStore {
    /// Append a line to `contact`'s conversation.
    fn append(&mut self, contact: &str, line: ChatLine) -> Result<(), ChatError>;

    /// All lines for `contact`, oldest first.
    fn history(&self, contact: &str) -> &[ChatLine];

    /// Contacts with at least one line, sorted.
    fn contacts(&self) -> Vec<String>;

    /// File `event` under its conversation. Returns the stored line.
    fn record(&mut self, event: &ChatEvent, me: &str) -> Result<Option<&ChatLine>, ChatError> {
        let Some(contact) = event.conversation(me).map(str::to_string) else {
            return Ok(None);
        };
        let Some(line) = ChatLine::from_event(event, me) else {
            return Ok(None);
        };
        self.append(&contact, line)?;
        Ok(self.history(&contact).last())
    }
}

/// In-memory [`ConversationStore`].
#[derive(Debug, Default)]
pub struct Transcript {
    conversations: HashMap<String, Vec<ChatLine>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for Transcript {
    fn append(&mut self, contact: &str, line: ChatLine) -> Result<(), ChatError> {
        self.conversations
            .entry(contact.to_string())
            .or_default()
            .push(line);
        Ok(())
    }

    fn history(&self, contact: &str) -> &[ChatLine] {
        self.conversations
            .get(contact)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn contacts(&self) -> Vec<String> {
        let mut contacts: Vec<String> = self.conversations.keys().cloned().collect();
        contacts.sort();
        contacts
    }
}

/// On-disk form of one conversation, before sealing.
#[derive(Serialize, Deserialize)]
struct StoredConversation<'a> {
    contact: Cow<'a, str>,
    lines: Cow<'a, [ChatLine]>,
}

/// [`ConversationStore`] that persists every conversation of one user.
///
/// Each conversation lives in `log_<owner>_with_<contact>.json.enc` inside
/// the history directory, rewritten in full on every append. Names are
/// reduced to ASCII letters, digits, `-` and `_` before they become part of
/// a file name.
pub struct FileTranscript {
    dir: PathBuf,
    owner: String,
    key: SessionKey,
    conversations: HashMap<String, Vec<ChatLine>>,
}

impl FileTranscript {
    /// Open `dir` for `owner`, creating the directory and its key file if
    /// needed, and load the owner's stored conversations.
    pub fn open(dir: impl Into<PathBuf>, owner: &str) -> Result<Self, ChatError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let key = load_or_create_key(&dir.join(HISTORY_KEY_FILE))?;
        Self::with_key(dir, owner, key)
    }

    /// Like [`open`](Self::open) with an explicit key.
    pub fn with_key(
        dir: impl Into<PathBuf>,
        owner: &str,
        key: SessionKey,
    ) -> Result<Self, ChatError> {
        let mut store = Self {
            dir: dir.into(),
            owner: owner.to_string(),
            key,
            conversations: HashMap::new(),
        };
        store.load_all()?;
        Ok(store)
    }

    fn log_prefix(&self) -> String {
        format!("log_{}_with_", safe_file_name(&self.owner))
    }

    fn log_path(&self, contact: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}{}",
            self.log_prefix(),
            safe_file_name(contact),
            LOG_SUFFIX
        ))
    }

    fn load_all(&mut self) -> Result<(), ChatError> {
        let prefix = self.log_prefix();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_ours = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(&prefix) && name.ends_with(LOG_SUFFIX))
                .unwrap_or(false);
            if !is_ours {
                continue;
            }
            match self.read_log(&path) {
                Ok((contact, lines)) => {
                    self.conversations.insert(contact, lines);
                }
                Err(error) => warn!(path = %path.display(), "skipping unreadable history: {error}"),
            }
        }
        Ok(())
    }

    fn read_log(&self, path: &Path) -> Result<(String, Vec<ChatLine>), ChatError> {
        let sealed: SealedPayload = from_bytes(&fs::read(path)?)?;
        let plaintext = Zeroizing::new(open(&self.key, &sealed)?);
        let stored: StoredConversation = from_bytes(&plaintext)?;
        Ok((stored.contact.into_owned(), stored.lines.into_owned()))
    }

    fn save(&self, contact: &str) -> Result<(), ChatError> {
        let stored = StoredConversation {
            contact: Cow::Borrowed(contact),
            lines: Cow::Borrowed(self.history(contact)),
        };
        let plaintext = Zeroizing::new(to_bytes(&stored)?);
        let sealed = seal(&self.key, &plaintext)?;

        let path = self.log_path(contact);
        let staging = path.with_extension("tmp");
        fs::write(&staging, to_bytes(&sealed)?)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }
}

impl ConversationStore for FileTranscript {
    fn append(&mut self, contact: &str, line: ChatLine) -> Result<(), ChatError> {
        self.conversations
            .entry(contact.to_string())
            .or_default()
            .push(line);
        self.save(contact)
    }

    fn history(&self, contact: &str) -> &[ChatLine] {
        self.conversations
            .get(contact)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn contacts(&self) -> Vec<String> {
        let mut contacts: Vec<String> = self.conversations.keys().cloned().collect();
        contacts.sort();
        contacts
    }
}

fn safe_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

fn load_or_create_key(path: &Path) -> Result<SessionKey, ChatError> {
    if path.exists() {
        let bytes = Zeroizing::new(fs::read(path)?);
        return Ok(SessionKey::from_slice(&bytes)?);
    }

    let key = SessionKey::generate();
    fs::write(path, key.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    Ok(key)
}
