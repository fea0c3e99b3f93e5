//! Wire Protocol
//!
//! Clients speak newline-delimited JSON over the socket. Every line is one
//! request or one response.
//!
//! ```text
//! → {"op":"send_message","hub":"tech-support","session_id":"s1","message":"Hi"}
//! ← {"type":"receive_message","hub":"tech-support","data":"StartAssistantResponse"}
//! ← {"type":"receive_message","hub":"tech-support","data":"Hello!"}
//! ← {"type":"receive_message","hub":"tech-support","data":"EndAssistantResponse"}
//! ```

use serde::{Deserialize, Serialize};

use hub_core::{ConnectionId, HubFrame};

/// A request from a client
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Send a user message and stream the reply back
    SendMessage {
        /// Target hub
        hub: String,
        /// Session to append to; blank means this connection
        #[serde(default)]
        session_id: String,
        /// User text
        message: String,
    },
    /// Replay a stored conversation
    GetAllMessages {
        /// Target hub
        hub: String,
        /// Session to replay; blank means this connection
        #[serde(default)]
        session_id: String,
    },
}

impl ClientRequest {
    /// Parse one request line
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Hub the request targets
    pub fn hub(&self) -> &str {
        match self {
            Self::SendMessage { hub, .. } | Self::GetAllMessages { hub, .. } => hub,
        }
    }
}

/// A message to a client
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once on accept so the client knows its fallback session id
    Connected {
        /// This connection's id
        connection_id: String,
    },
    /// One frame from a hub
    ReceiveMessage {
        /// Hub that produced the frame
        hub: String,
        /// Frame text: a marker or content
        data: String,
    },
    /// A request failed
    Error {
        /// Hub the failed request targeted, if it could be parsed
        #[serde(skip_serializing_if = "Option::is_none")]
        hub: Option<String>,
        /// What went wrong
        message: String,
    },
}

impl ServerMessage {
    /// Greeting for a new connection
    pub fn connected(id: &ConnectionId) -> Self {
        Self::Connected {
            connection_id: id.to_string(),
        }
    }

    /// Wrap a hub frame
    pub fn frame(hub: &str, frame: &HubFrame) -> Self {
        Self::ReceiveMessage {
            hub: hub.to_string(),
            data: frame.wire_text(),
        }
    }

    /// Error for a request
    pub fn error(hub: Option<&str>, message: impl Into<String>) -> Self {
        Self::Error {
            hub: hub.map(str::to_string),
            message: message.into(),
        }
    }

    /// Serialize as one newline-terminated line
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
