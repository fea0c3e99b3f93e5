//! Hub Messages
//!
//! Identifiers, roles and the framed events a hub pushes to a connected client.
//!
//! # Framing
//!
//! Every turn a client sees, live or replayed, is delimited by control markers:
//!
//! ```text
//! StartAssistantResponse
//! <text> <text> ...
//! EndAssistantResponse
//! ```
//!
//! The markers travel on the same channel as the text, so a client tells them
//! apart by exact string match against [`HubFrame::wire_text`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session identifier
///
/// Opaque string supplied by the caller. Blank ids are never stored; they are
/// resolved to the caller's [`ConnectionId`] first (see [`SessionId::resolve`]).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session id from any string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Resolve the session id for a call
    ///
    /// A blank requested id falls back to the connection id, which makes the
    /// session ephemeral and scoped to that connection.
    #[must_use]
    pub fn resolve(requested: &str, connection: &ConnectionId) -> Self {
        if requested.trim().is_empty() {
            Self(connection.0.clone())
        } else {
            Self(requested.to_string())
        }
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one live client connection
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a new unique connection id
    #[must_use]
    pub fn new() -> Self {
        Self(format!("conn-{}", uuid::Uuid::new_v4()))
    }

    /// Wrap an id issued by the host transport
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Configured system prompt
    System,
    /// Human client
    User,
    /// Completion backend
    Assistant,
    /// Tool output fed back to the backend
    Tool,
}

impl Role {
    /// Name used inside frame markers (`Start{Name}Response`)
    #[must_use]
    pub fn frame_name(self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::Tool => "Tool",
        }
    }

    /// Lowercase name used by OpenAI-style APIs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A framed event pushed to a client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HubFrame {
    /// Opens a turn (`StartUserResponse`, `StartAssistantResponse`)
    Start {
        /// Author of the turn being opened
        role: Role,
    },
    /// Turn content: a raw chunk, a buffered aggregate or a whole message
    Text {
        /// The text
        text: String,
    },
    /// Closes a turn (`EndUserResponse`, `EndAssistantResponse`)
    End {
        /// Author of the turn being closed
        role: Role,
    },
}

impl HubFrame {
    /// Start marker for `role`
    #[must_use]
    pub fn start(role: Role) -> Self {
        Self::Start { role }
    }

    /// Text event
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// End marker for `role`
    #[must_use]
    pub fn end(role: Role) -> Self {
        Self::End { role }
    }

    /// The string a client receives for this frame
    #[must_use]
    pub fn wire_text(&self) -> String {
        match self {
            Self::Start { role } => format!("Start{}Response", role.frame_name()),
            Self::Text { text } => text.clone(),
            Self::End { role } => format!("End{}Response", role.frame_name()),
        }
    }
}

impl fmt::Display for HubFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_text())
    }
}

/// Token usage totals reported by a backend
///
/// Totals are cumulative for a request; the latest report replaces earlier ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u32,
    /// Completion tokens
    pub output_tokens: u32,
    /// Prompt plus completion
    pub total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_text() {
        assert_eq!(
            HubFrame::start(Role::Assistant).wire_text(),
            "StartAssistantResponse"
        );
        assert_eq!(HubFrame::end(Role::User).wire_text(), "EndUserResponse");
        assert_eq!(HubFrame::text("hello").wire_text(), "hello");
        assert_eq!(HubFrame::start(Role::User).to_string(), "StartUserResponse");
    }

    #[test]
    fn test_session_id_resolve_falls_back_to_connection() {
        let conn = ConnectionId::from_raw("conn-42");
        assert_eq!(SessionId::resolve("", &conn), SessionId::new("conn-42"));
        assert_eq!(SessionId::resolve("   ", &conn), SessionId::new("conn-42"));
        assert_eq!(SessionId::resolve("s1", &conn), SessionId::new("s1"));
    }

    #[test]
    fn test_connection_id_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("conn-"));
    }

    #[test]
    fn test_frame_serialization() {
        let json = serde_json::to_string(&HubFrame::start(Role::Assistant)).unwrap();
        assert_eq!(json, r#"{"kind":"start","role":"assistant"}"#);
    }
}
