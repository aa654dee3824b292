//! # Chat Log
//!
//! Bounded ring of chat messages plus slash-command dispatch.
//!
//! Handled commands are not stored as visible chat; unknown commands come
//! back as a private system message to the sender only.

use std::collections::VecDeque;

use atrium_core::short_id;
use atrium_shared::constants::CHAT_MAX_MESSAGES;
use atrium_shared::ChatMessage;

/// What a parsed command asks the world to do.
///
/// The log only parses; role checks and mutations happen in the world,
/// which owns users and the spawn point.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandOutcome {
    /// Not a command: store (and broadcast) as ordinary chat.
    NotACommand,
    /// `/name <new>`.
    SetName {
        /// Requested display name.
        name: String,
    },
    /// `/admin <code>`.
    GrantAdmin {
        /// Submitted secret.
        code: String,
    },
    /// `/spawn set` (admin/builder only).
    SpawnSet,
    /// `/spawn clear` (admin/builder only).
    SpawnClear,
    /// Anything else starting with `/`.
    Unknown {
        /// The command word, for the error message.
        command: String,
    },
}

/// Parses a chat body as a command.
#[must_use]
pub fn parse_command(body: &str) -> CommandOutcome {
    let Some(rest) = body.strip_prefix('/') else {
        return CommandOutcome::NotACommand;
    };
    let mut parts = rest.split_whitespace();
    let command = parts.next().unwrap_or("");
    match command {
        "name" => {
            let name = parts.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                CommandOutcome::Unknown {
                    command: "name".to_owned(),
                }
            } else {
                CommandOutcome::SetName { name }
            }
        }
        "admin" => CommandOutcome::GrantAdmin {
            code: parts.next().unwrap_or("").to_owned(),
        },
        "spawn" => match parts.next() {
            Some("set") => CommandOutcome::SpawnSet,
            Some("clear") => CommandOutcome::SpawnClear,
            _ => CommandOutcome::Unknown {
                command: "spawn".to_owned(),
            },
        },
        other => CommandOutcome::Unknown {
            command: other.to_owned(),
        },
    }
}

/// Bounded ring of the most recent chat messages.
pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
    capacity: usize,
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatLog {
    /// Creates a log with the standard retention.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: VecDeque::with_capacity(CHAT_MAX_MESSAGES),
            capacity: CHAT_MAX_MESSAGES,
        }
    }

    /// Number of retained messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Appends a message, evicting the oldest beyond the retention cap.
    pub fn add(&mut self, message: ChatMessage) {
        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Builds a server-minted system message (not yet stored).
    #[must_use]
    pub fn system_message(body: impl Into<String>, now_secs: f64) -> ChatMessage {
        ChatMessage {
            id: short_id(),
            from: None,
            from_name: Some("System".to_owned()),
            body: body.into(),
            created_at: now_secs,
        }
    }

    /// Messages oldest-first.
    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    /// Snapshot of the retained messages, oldest-first.
    #[must_use]
    pub fn serialize(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    /// Replaces the log from a snapshot, honoring the retention cap.
    pub fn deserialize(&mut self, messages: Vec<ChatMessage>) {
        self.messages.clear();
        for message in messages {
            self.add(message);
        }
    }
}
