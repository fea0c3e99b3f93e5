//! Session Management
//!
//! Conversations and the sessions that own them.
//!
//! # Design Philosophy
//!
//! A conversation is an append-only log. The single exception is index 0,
//! which holds the configured system message and is replaced in place when
//! the configuration changes. Nothing else is ever edited, reordered or
//! removed; a session shrinks only by expiring as a whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::messages::{Role, SessionId};

/// A message in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who sent this message
    pub role: Role,
    /// Message text
    pub text: String,
    /// Tool-call payload passed back to the backend untouched
    ///
    /// Assistant messages carry the requested calls, tool messages carry the
    /// id of the call they answer. Never framed for clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_payload: Option<serde_json::Value>,
    /// When the message was created
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a message
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tool_payload: None,
            created_at: Utc::now(),
        }
    }

    /// System message
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    /// User message
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Tool result message
    pub fn tool(text: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(Role::Tool, text).with_tool_payload(payload)
    }

    /// Attach a tool-call payload
    #[must_use]
    pub fn with_tool_payload(mut self, payload: serde_json::Value) -> Self {
        self.tool_payload = Some(payload);
        self
    }

    /// Whether replay surfaces this message to clients
    ///
    /// Only plain user and assistant turns are visible. System prompts, tool
    /// results and assistant tool-call requests stay backend-only.
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        matches!(self.role, Role::User | Role::Assistant) && self.tool_payload.is_none()
    }
}

/// Outcome of writing the system slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemSlot {
    /// No system message existed; one was inserted at index 0
    Inserted,
    /// The existing system message had different text and was replaced
    Replaced,
    /// The existing system message already matched
    Unchanged,
}

/// Ordered message log for one session
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    /// Create an empty conversation
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages in chat order
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the conversation has no messages
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a message
    ///
    /// System messages never go through here; they live only in the slot
    /// managed by [`Conversation::upsert_system`].
    pub fn push(&mut self, message: ChatMessage) {
        debug_assert!(message.role != Role::System, "system messages use upsert_system");
        self.messages.push(message);
    }

    /// Insert or replace the system message at index 0
    pub fn upsert_system(&mut self, text: &str) -> SystemSlot {
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                if first.text == text {
                    SystemSlot::Unchanged
                } else {
                    *first = ChatMessage::system(text);
                    SystemSlot::Replaced
                }
            }
            _ => {
                self.messages.insert(0, ChatMessage::system(text));
                SystemSlot::Inserted
            }
        }
    }

    /// The current system message, if any
    #[must_use]
    pub fn system_message(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.text.as_str())
    }

    /// Messages a client may see on replay
    pub fn replayable(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.is_replayable())
    }
}

/// A conversation session held by a store
#[derive(Clone, Debug)]
pub struct Session {
    /// Session ID
    pub id: SessionId,
    /// Conversation history
    pub conversation: Conversation,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Last write, drives idle expiry
    last_touched: Instant,
}

impl Session {
    /// Create an empty session
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            conversation: Conversation::new(),
            created_at: Utc::now(),
            last_touched: Instant::now(),
        }
    }

    /// Refresh the idle timer
    pub fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    /// Time since the last write
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_touched.elapsed()
    }

    /// Whether the session has been idle longer than `window`
    #[must_use]
    pub fn is_expired(&self, window: Duration) -> bool {
        self.idle_for() > window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_system_inserts_at_front() {
        let mut conv = Conversation::new();
        conv.push(ChatMessage::user("hi"));

        assert_eq!(conv.upsert_system("Be brief"), SystemSlot::Inserted);
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.system_message(), Some("Be brief"));
        assert_eq!(conv.messages()[1].text, "hi");
    }

    #[test]
    fn test_upsert_system_is_idempotent() {
        let mut conv = Conversation::new();
        conv.upsert_system("Be brief");
        conv.push(ChatMessage::user("one"));
        assert_eq!(conv.upsert_system("Be brief"), SystemSlot::Unchanged);
        conv.push(ChatMessage::assistant("two"));
        assert_eq!(conv.upsert_system("Be brief"), SystemSlot::Unchanged);

        let systems = conv
            .messages()
            .iter()
            .filter(|m| m.role == Role::System)
            .count();
        assert_eq!(systems, 1);
        assert_eq!(conv.len(), 3);
    }

    #[test]
    fn test_upsert_system_replaces_without_reordering() {
        let mut conv = Conversation::new();
        conv.upsert_system("old");
        conv.push(ChatMessage::user("q"));
        conv.push(ChatMessage::assistant("a"));

        assert_eq!(conv.upsert_system("new"), SystemSlot::Replaced);
        let texts: Vec<_> = conv.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["new", "q", "a"]);
    }

    #[test]
    fn test_replayable_filters_backend_only_messages() {
        let mut conv = Conversation::new();
        conv.upsert_system("sys");
        conv.push(ChatMessage::user("q"));
        conv.push(
            ChatMessage::assistant("")
                .with_tool_payload(serde_json::json!({"tool_calls": []})),
        );
        conv.push(ChatMessage::tool("42", serde_json::json!({"tool_call_id": "c1"})));
        conv.push(ChatMessage::assistant("a"));

        let visible: Vec<_> = conv.replayable().map(|m| m.text.as_str()).collect();
        assert_eq!(visible, vec!["q", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expiry_window() {
        let mut session = Session::new(SessionId::new("s1"));
        let window = Duration::from_secs(60);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!session.is_expired(window));

        session.touch();
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(!session.is_expired(window));

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(session.is_expired(window));
    }
}
