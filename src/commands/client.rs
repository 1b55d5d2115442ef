//! Interactive chat client command.
//!
//! Reads commands from stdin and prints events as they arrive:
//!
//! - `<text>` - send to everyone
//! - `/msg <nick> <text>` - private message
//! - `/file <nick|public> <path>` - send a file
//! - `/users` - show who is online
//! - `/history [contact]` - show a stored conversation
//! - `/quit` - leave

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tracing::{info, warn};

use sirius::chat::client::PUBLIC_CONVERSATION;
use sirius::chat::input::{parse_input, InputCommand, HELP_LINES};
use sirius::chat::{
    ChatError, ChatEvent, ChatLine, ClientConfig, ClientSender, ConversationStore, FileTranscript,
    MessageRenderer, TcpChatClient, TerminalRenderer, Transcript,
};
use sirius::crypto::KeyPair;

use super::{load_config, runtime, CommandExecutor};

/// Connect to a chat server.
#[derive(Args, Debug)]
pub struct ClientCommand {
    /// Nickname to log in with
    #[arg(short, long)]
    pub nick: String,

    /// Server address, e.g. 127.0.0.1:5000 (overrides the config file)
    #[arg(short, long)]
    pub server: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Save received files into this directory
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Keep encrypted conversation logs in this directory
    #[arg(long)]
    pub history_dir: Option<PathBuf>,
}

impl ClientCommand {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = load_config(self.config.as_deref())?.client;
        if let Some(server) = &self.server {
            config.server_addr = server.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn open_transcript(&self, nick: &str) -> Result<Box<dyn ConversationStore + Send>> {
        match &self.history_dir {
            Some(dir) => {
                let store = FileTranscript::open(dir, nick)
                    .with_context(|| format!("Failed to open history in {}", dir.display()))?;
                info!(dir = %dir.display(), contacts = store.contacts().len(), "loaded history");
                Ok(Box::new(store))
            }
            None => Ok(Box::new(Transcript::new())),
        }
    }
}

impl CommandExecutor for ClientCommand {
    fn execute(&self) -> Result<()> {
        let config = self.client_config()?;
        let nick = self.nick.trim();
        if nick.is_empty() || nick == PUBLIC_CONVERSATION {
            anyhow::bail!("'{}' cannot be used as a nickname", self.nick);
        }

        info!(bits = config.rsa_bits, "generating client key pair");
        let identity =
            KeyPair::generate_with_bits(config.rsa_bits).context("Failed to generate key pair")?;
        let transcript = self.open_transcript(nick)?;

        runtime()?.block_on(run_client(
            config,
            identity,
            nick.to_string(),
            transcript,
            self.download_dir.clone(),
        ))
    }
}

/// Local state of an interactive session.
struct ClientState {
    nick: String,
    users: Vec<String>,
    transcript: Box<dyn ConversationStore + Send>,
    renderer: TerminalRenderer<std::io::Stdout>,
    download_dir: Option<PathBuf>,
}

async fn run_client(
    config: ClientConfig,
    identity: KeyPair,
    nick: String,
    transcript: Box<dyn ConversationStore + Send>,
    download_dir: Option<PathBuf>,
) -> Result<()> {
    let client = TcpChatClient::connect(&config, &identity)
        .await
        .with_context(|| format!("Failed to connect to {}", config.server_addr))?;
    let (mut sender, mut receiver) = client.into_split();
    sender.login(&nick).await?;

    let mut state = ClientState {
        nick,
        users: Vec::new(),
        transcript,
        renderer: TerminalRenderer::stdout(),
        download_dir,
    };
    state.renderer.notice(&format!(
        "Connected to {} as {}. Type /help for commands.",
        config.server_addr, state.nick
    ))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if !handle_input(&mut sender, &mut state, &line).await? {
                    break;
                }
            }
            event = receiver.next_event() => {
                match event.context("Connection lost")? {
                    Some(event) => handle_event(&mut state, event).await?,
                    None => {
                        state.renderer.notice("Server closed the connection")?;
                        break;
                    }
                }
            }
        }
    }

    if let Err(error) = sender.close().await {
        warn!("close failed: {error}");
    }
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_input<W>(
    sender: &mut ClientSender<W>,
    state: &mut ClientState,
    line: &str,
) -> Result<bool>
where
    W: AsyncWrite + Unpin + Send,
{
    match parse_input(line) {
        InputCommand::Empty => {}
        InputCommand::Quit => return Ok(false),
        InputCommand::Help => {
            for help in HELP_LINES {
                state.renderer.notice(help)?;
            }
        }
        InputCommand::Invalid(message) => state.renderer.notice(&message)?,
        InputCommand::Users => {
            let users = if state.users.is_empty() {
                "(nobody)".to_string()
            } else {
                state.users.join(", ")
            };
            state.renderer.notice(&format!("Online: {}", users))?;
        }
        InputCommand::History(contact) => {
            let contact = contact.as_deref().unwrap_or(PUBLIC_CONVERSATION);
            state
                .renderer
                .render_history(contact, state.transcript.history(contact))?;
        }
        InputCommand::Public(text) => {
            sender.send_public(&text).await?;
            let line = ChatLine::from_you(text);
            persist(state.transcript.append(PUBLIC_CONVERSATION, line));
        }
        InputCommand::Private { recipient, text } => {
            // The server's echo goes into the transcript.
            sender.send_private(&recipient, &text).await?;
        }
        InputCommand::File { recipient, path } => {
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(error) => {
                    state
                        .renderer
                        .notice(&format!("Cannot read {}: {}", path.display(), error))?;
                    return Ok(true);
                }
            };
            let filename = display_name(&path);
            sender.send_file(&recipient, &filename, &data).await?;
            let line =
                ChatLine::system(format!("you sent file '{}' ({} bytes)", filename, data.len()));
            persist(state.transcript.append(&recipient, line));
            state
                .renderer
                .notice(&format!("Sent {} to {}", filename, recipient))?;
        }
    }
    Ok(true)
}

async fn handle_event(state: &mut ClientState, event: ChatEvent) -> Result<()> {
    if let ChatEvent::Roster(users) = &event {
        state.users = users.clone();
    }
    persist(state.transcript.record(&event, &state.nick).map(|_| ()));
    state.renderer.render_event(&event, &state.nick)?;

    if let (Some(dir), ChatEvent::File { filename, data, .. }) = (&state.download_dir, &event) {
        let target = dir.join(display_name(Path::new(filename)));
        match tokio::fs::write(&target, data).await {
            Ok(()) => state
                .renderer
                .notice(&format!("Saved to {}", target.display()))?,
            Err(error) => state
                .renderer
                .notice(&format!("Cannot save {}: {}", target.display(), error))?,
        }
    }
    Ok(())
}

/// A history write failing does not end the session.
fn persist(result: Result<(), ChatError>) {
    if let Err(error) = result {
        warn!("failed to store history: {error}");
    }
}

/// Last path component, so a peer cannot write outside the download dir.
fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_strips_directories() {
        assert_eq!(display_name(Path::new("/etc/passwd")), "passwd");
        assert_eq!(display_name(Path::new("../../evil.sh")), "evil.sh");
        assert_eq!(display_name(Path::new("..")), "file");
    }

    #[test]
    fn test_server_flag_overrides_default() {
        let command = ClientCommand {
            nick: "alice".to_string(),
            server: Some("10.0.0.2:5000".to_string()),
            config: None,
            download_dir: None,
            history_dir: None,
        };
        assert_eq!(command.client_config().unwrap().server_addr, "10.0.0.2:5000");
    }

    #[test]
    fn test_history_dir_selects_file_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let command = ClientCommand {
            nick: "alice".to_string(),
            server: None,
            config: None,
            download_dir: None,
            history_dir: Some(dir.path().to_path_buf()),
        };

        let mut transcript = command.open_transcript("alice").unwrap();
        transcript
            .append("bob", ChatLine::from_you("see you"))
            .unwrap();
        assert!(dir.path().join("log_alice_with_bob.json.enc").exists());

        let reopened = command.open_transcript("alice").unwrap();
        assert_eq!(reopened.history("bob").len(), 1);
    }
}
