//! Parsing of client input lines.

use std::path::PathBuf;

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    /// Plain text, sent to everyone.
    Public(String),
    /// `/msg <nick> <text>`
    Private { recipient: String, text: String },
    /// `/file <nick|public> <path>`
    File { recipient: String, path: PathBuf },
    /// `/users`
    Users,
    /// `/history [contact]`
    History(Option<String>),
    /// `/help`
    Help,
    /// `/quit`
    Quit,
    /// Blank line.
    Empty,
    /// A command we could not parse; carries the message to show.
    Invalid(String),
}

pub const HELP_LINES: &[&str] = &[
    "Commands:",
    "  <text>                     Send to everyone",
    "  /msg <nick> <text>         Private message",
    "  /file <nick|public> <path> Send a file",
    "  /users                     Show online users",
    "  /history [contact]         Show a conversation (default: public)",
    "  /help, /h                  Show this help",
    "  /quit, /q                  Exit",
];

/// Parse one line typed by the user.
pub fn parse_input(line: &str) -> InputCommand {
    let line = line.trim();
    if line.is_empty() {
        return InputCommand::Empty;
    }
    if !line.starts_with('/') {
        return InputCommand::Public(line.to_string());
    }

    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" | "/q" | "/exit" => InputCommand::Quit,
        "/help" | "/h" | "/?" => InputCommand::Help,
        "/users" | "/u" => InputCommand::Users,
        "/history" => {
            if rest.is_empty() {
                InputCommand::History(None)
            } else {
                InputCommand::History(Some(rest.to_string()))
            }
        }
        "/msg" | "/m" => match split_target(rest) {
            Some((recipient, text)) => InputCommand::Private {
                recipient,
                text: text.to_string(),
            },
            None => InputCommand::Invalid("Usage: /msg <nick> <text>".to_string()),
        },
        "/file" | "/f" => match split_target(rest) {
            Some((recipient, path)) => InputCommand::File {
                recipient,
                path: PathBuf::from(path),
            },
            None => InputCommand::Invalid("Usage: /file <nick|public> <path>".to_string()),
        },
        other => InputCommand::Invalid(format!(
            "Unknown command: {} (type /help for commands)",
            other
        )),
    }
}

fn split_target(rest: &str) -> Option<(String, &str)> {
    let (target, remainder) = rest.split_once(char::is_whitespace)?;
    let remainder = remainder.trim();
    if target.is_empty() || remainder.is_empty() {
        return None;
    }
    Some((target.to_string(), remainder))
}
