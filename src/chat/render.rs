//! Terminal output for the chat client.

use std::io::{self, Write};

use crate::chat::client::ChatEvent;
use crate::chat::transcript::{ChatLine, LineAuthor};

/// Displays decoded events and client notices.
pub trait MessageRenderer {
    /// Show one incoming event.
    fn render_event(&mut self, event: &ChatEvent, me: &str) -> io::Result<()>;

    /// Show a local notice (errors, command output).
    fn notice(&mut self, text: &str) -> io::Result<()>;

    /// Show stored lines of one conversation.
    fn render_history(&mut self, contact: &str, lines: &[ChatLine]) -> io::Result<()>;
}

/// Plain line-oriented renderer over any writer.
pub struct TerminalRenderer<W: Write> {
    out: W,
}

impl TerminalRenderer<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.out, "{}", line)?;
        self.out.flush()
    }
}

fn format_event(event: &ChatEvent, me: &str) -> String {
    match event {
        ChatEvent::Public { sender, text } => format!("[public] {}: {}", sender, text),
        ChatEvent::Private { sender, text } => format!("[private] {} -> you: {}", sender, text),
        ChatEvent::PrivateEcho { recipient, text } => {
            format!("[private] you -> {}: {}", recipient, text)
        }
        ChatEvent::Roster(users) => format!("[users] {}", users.join(", ")),
        ChatEvent::File {
            sender,
            recipient,
            filename,
            data,
        } => {
            let from = if sender == me { "you" } else { sender.as_str() };
            format!(
                "[file] {} -> {}: {} ({} bytes)",
                from,
                recipient,
                filename,
                data.len()
            )
        }
        ChatEvent::Unreadable { sender, .. } => format!("[corrupt message from {}]", sender),
    }
}

fn format_line(line: &ChatLine) -> String {
    match &line.author {
        LineAuthor::You => format!("[{}] you: {}", line.formatted_time(), line.content),
        LineAuthor::Peer(name) => format!("[{}] {}: {}", line.formatted_time(), name, line.content),
        LineAuthor::System => format!("[{}] {}", line.formatted_time(), line.content),
    }
}

impl<W: Write> MessageRenderer for TerminalRenderer<W> {
    fn render_event(&mut self, event: &ChatEvent, me: &str) -> io::Result<()> {
        self.write_line(&format_event(event, me))
    }

    fn notice(&mut self, text: &str) -> io::Result<()> {
        self.write_line(&format!("* {}", text))
    }

    fn render_history(&mut self, contact: &str, lines: &[ChatLine]) -> io::Result<()> {
        if lines.is_empty() {
            return self.notice(&format!("No history with {}", contact));
        }
        self.write_line(&format!("--- {} ---", contact))?;
        for line in lines {
            self.write_line(&format_line(line))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(f: impl FnOnce(&mut TerminalRenderer<Vec<u8>>)) -> String {
        let mut renderer = TerminalRenderer::new(Vec::new());
        f(&mut renderer);
        String::from_utf8(renderer.into_inner()).unwrap()
    }

    #[test]
    fn test_render_events() {
        let out = rendered(|r| {
            r.render_event(
                &ChatEvent::Public {
                    sender: "bob".to_string(),
                    text: "hi".to_string(),
                },
                "alice",
            )
            .unwrap();
            r.render_event(
                &ChatEvent::PrivateEcho {
                    recipient: "bob".to_string(),
                    text: "psst".to_string(),
                },
                "alice",
            )
            .unwrap();
            r.render_event(
                &ChatEvent::Roster(vec!["alice".to_string(), "bob".to_string()]),
                "alice",
            )
            .unwrap();
        });
        assert_eq!(
            out,
            "[public] bob: hi\n[private] you -> bob: psst\n[users] alice, bob\n"
        );
    }

    #[test]
    fn test_render_history() {
        let lines = vec![
            ChatLine {
                author: LineAuthor::Peer("bob".to_string()),
                content: "hey".to_string(),
                timestamp: 60,
            },
            ChatLine {
                author: LineAuthor::You,
                content: "hello".to_string(),
                timestamp: 120,
            },
        ];
        let out = rendered(|r| r.render_history("bob", &lines).unwrap());
        assert_eq!(out, "--- bob ---\n[00:01] bob: hey\n[00:02] you: hello\n");

        let out = rendered(|r| r.render_history("dave", &[]).unwrap());
        assert_eq!(out, "* No history with dave\n");
    }
}
