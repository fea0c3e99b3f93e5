//! Chat Hub - The Orchestration Core
//!
//! A [`ChatHub`] relays one bot's conversations between clients and a
//! completion backend. It:
//! - keeps each session's conversation in a [`ConversationStore`]
//! - injects the configured system message
//! - drives the backend through tool-call continuation rounds
//! - streams the reply to the caller's [`DeliverySink`] in framed events
//! - replays stored conversations with the same framing
//!
//! # Design Philosophy
//!
//! Bots differ only in configuration. A "tech-support" hub and a "joke-bot"
//! hub are the same type with different [`HubConfig`]s, and may share one
//! backend. The hub knows nothing about transports; the host hands it a sink
//! per call.
//!
//! # Call Lifecycle
//!
//! ```text
//! Idle ─▶ AwaitingCompletion ─┬─▶ Delivering ─▶ Idle
//!              ▲              │
//!              └─ ToolCallPending ◀┘ (finish reason = tool calls)
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::time::Duration;

use crate::backend::{BackendError, CompletionBackend, CompletionChunk};
use crate::delivery::DeliverySink;
use crate::error::HubError;
use crate::messages::{HubFrame, Role, SessionId, TokenUsage};
use crate::replay::replay_conversation;
use crate::session::{ChatMessage, Conversation};
use crate::store::{
    ConversationStore, MemoryConversationStore, StoreConfig, DEFAULT_SLIDING_EXPIRATION,
};
use crate::streaming::StreamAggregator;

/// Default system message
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant.";

/// Default cap on tool-call continuation rounds
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 8;

/// Per-bot configuration
///
/// Immutable once the hub is built; one per bot identity, never per session.
#[derive(Clone, Debug, PartialEq)]
pub struct HubConfig {
    /// Bot name, used for routing and logs
    pub name: String,
    /// System message kept at index 0 (blank disables injection)
    pub system_message: String,
    /// Stream chunks as they arrive, or send the reply as one event
    pub stream_response: bool,
    /// Aggregation threshold (0 or 1 forwards every chunk)
    pub stream_buffer_threshold: usize,
    /// Idle window after which a session is evicted
    pub sliding_expiration: Duration,
    /// Maximum tool-call continuation rounds per call
    pub max_tool_rounds: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            stream_response: true,
            stream_buffer_threshold: 1,
            sliding_expiration: DEFAULT_SLIDING_EXPIRATION,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

impl HubConfig {
    /// Default configuration for a named bot
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the system message
    #[must_use]
    pub fn with_system_message(mut self, text: impl Into<String>) -> Self {
        self.system_message = text.into();
        self
    }

    /// Enable or disable streaming
    #[must_use]
    pub fn with_stream_response(mut self, stream: bool) -> Self {
        self.stream_response = stream;
        self
    }

    /// Set the aggregation threshold
    #[must_use]
    pub fn with_stream_buffer_threshold(mut self, threshold: usize) -> Self {
        self.stream_buffer_threshold = threshold;
        self
    }

    /// Set the sliding expiration
    #[must_use]
    pub fn with_sliding_expiration(mut self, window: Duration) -> Self {
        self.sliding_expiration = window;
        self
    }

    /// Set the tool-call round cap
    #[must_use]
    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// Store configuration derived from this bot's settings
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::default().with_sliding_expiration(self.sliding_expiration)
    }
}

/// Outcome of a completed [`ChatHub::send_message`] call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamResult {
    /// Full assistant reply
    pub assistant_text: String,
    /// Prompt tokens (latest reported total)
    pub input_tokens: u32,
    /// Completion tokens (latest reported total)
    pub output_tokens: u32,
    /// Total tokens (latest reported total)
    pub total_tokens: u32,
    /// Tool-call continuation rounds taken
    pub tool_rounds: u32,
}

/// Where a call is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HubPhase {
    /// No call in flight
    Idle,
    /// Waiting on a backend round
    AwaitingCompletion,
    /// The backend asked for tool calls; another round follows
    ToolCallPending,
    /// Flushing, persisting and closing the turn
    Delivering,
}

impl fmt::Display for HubPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingCompletion => "awaiting_completion",
            Self::ToolCallPending => "tool_call_pending",
            Self::Delivering => "delivering",
        };
        f.write_str(name)
    }
}

/// What the completion loop produced
struct Completion {
    text: String,
    usage: TokenUsage,
    extensions: Vec<ChatMessage>,
    tool_rounds: u32,
}

/// Chat relay hub for one bot
pub struct ChatHub<B: CompletionBackend, S: ConversationStore + ?Sized = MemoryConversationStore> {
    /// Bot configuration
    config: HubConfig,
    /// Completion backend
    backend: Arc<B>,
    /// Session storage
    store: Arc<S>,
}

impl<B: CompletionBackend> ChatHub<B, MemoryConversationStore> {
    /// Create a hub with its own in-memory store
    ///
    /// `max_sessions` caps live sessions (0 = unlimited). Idle sessions are
    /// only reclaimed on access unless [`spawn_sweeper`](crate::spawn_sweeper)
    /// runs against [`ChatHub::store`].
    pub fn with_memory_store(config: HubConfig, backend: Arc<B>, max_sessions: usize) -> Self {
        let store = MemoryConversationStore::new(
            config.store_config().with_max_sessions(max_sessions),
        );
        Self::new(config, backend, Arc::new(store))
    }
}

impl<B: CompletionBackend, S: ConversationStore + ?Sized> ChatHub<B, S> {
    /// Create a hub over an existing backend and store
    pub fn new(config: HubConfig, backend: Arc<B>, store: Arc<S>) -> Self {
        tracing::info!(
            hub = %config.name,
            backend = backend.name(),
            stream = config.stream_response,
            buffer = config.stream_buffer_threshold,
            "Chat hub created"
        );
        Self {
            config,
            backend,
            store,
        }
    }

    /// Bot configuration
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Bot name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Session storage
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Completion backend
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Send a user message and stream the assistant's reply to `sink`
    ///
    /// A blank `session_id` falls back to the sink's connection id. The user
    /// message is persisted before the backend is called and stays persisted
    /// whatever happens next. The assistant message is persisted only when
    /// the reply completes; a failed or cancelled call discards partial text.
    ///
    /// Calls on the same session run one at a time.
    pub async fn send_message<D>(
        &self,
        sink: &D,
        session_id: &str,
        user_message: &str,
    ) -> Result<StreamResult, HubError>
    where
        D: DeliverySink + ?Sized,
    {
        let session_id = SessionId::resolve(session_id, sink.connection_id());

        let _guard = tokio::select! {
            guard = self.store.lock_session(&session_id) => guard,
            () = sink.closed() => return Err(HubError::Cancelled),
        };

        if !self.config.system_message.trim().is_empty() {
            self.store
                .upsert_system(&session_id, &self.config.system_message)?;
        }
        self.store
            .append(&session_id, ChatMessage::user(user_message))?;

        sink.deliver(HubFrame::start(Role::Assistant)).await?;

        let working = self.store.get(&session_id);
        let outcome = tokio::select! {
            result = self.run_completion(sink, &session_id, working) => result,
            () = sink.closed() => Err(HubError::Cancelled),
        };

        let completion = match outcome {
            Ok(completion) => completion,
            Err(err) => {
                tracing::warn!(
                    hub = %self.config.name,
                    session_id = %session_id,
                    error = %err,
                    "Send failed, partial reply discarded"
                );
                return Err(err);
            }
        };

        tracing::trace!(hub = %self.config.name, phase = %HubPhase::Delivering, "Persisting reply");
        for message in completion.extensions {
            self.store.append(&session_id, message)?;
        }
        self.store
            .append(&session_id, ChatMessage::assistant(completion.text.clone()))?;

        sink.deliver(HubFrame::end(Role::Assistant)).await?;

        tracing::debug!(
            hub = %self.config.name,
            session_id = %session_id,
            chars = completion.text.len(),
            total_tokens = completion.usage.total_tokens,
            tool_rounds = completion.tool_rounds,
            phase = %HubPhase::Idle,
            "Reply delivered"
        );

        Ok(StreamResult {
            assistant_text: completion.text,
            input_tokens: completion.usage.input_tokens,
            output_tokens: completion.usage.output_tokens,
            total_tokens: completion.usage.total_tokens,
            tool_rounds: completion.tool_rounds,
        })
    }

    /// Replay a stored conversation to `sink`
    ///
    /// Returns the number of turns replayed. Does not touch the session.
    pub async fn get_all_messages<D>(&self, sink: &D, session_id: &str) -> Result<usize, HubError>
    where
        D: DeliverySink + ?Sized,
    {
        let session_id = SessionId::resolve(session_id, sink.connection_id());
        let conversation = self.store.get(&session_id);
        let turns = replay_conversation(&conversation, sink).await?;
        tracing::debug!(hub = %self.config.name, session_id = %session_id, turns = turns, "Conversation replayed");
        Ok(turns)
    }

    /// Drive the backend until a round finishes without requesting tools
    async fn run_completion<D>(
        &self,
        sink: &D,
        session_id: &SessionId,
        mut working: Conversation,
    ) -> Result<Completion, HubError>
    where
        D: DeliverySink + ?Sized,
    {
        let mut aggregator = StreamAggregator::new(self.config.stream_buffer_threshold);
        let mut text = String::new();
        let mut usage = TokenUsage::default();
        let mut extensions = Vec::new();
        let mut tool_rounds = 0;

        loop {
            tracing::trace!(
                hub = %self.config.name,
                session_id = %session_id,
                round = tool_rounds,
                phase = %HubPhase::AwaitingCompletion,
                "Invoking backend"
            );
            let mut rx = self.backend.stream_completion(working.messages()).await?;

            let reason = loop {
                match rx.recv().await {
                    Some(CompletionChunk::Text(chunk)) => {
                        text.push_str(&chunk);
                        if self.config.stream_response {
                            if let Some(out) = aggregator.push(chunk) {
                                sink.deliver(HubFrame::text(out)).await?;
                            }
                        }
                    }
                    Some(CompletionChunk::Usage(totals)) => usage = totals,
                    Some(CompletionChunk::Extend(message)) => {
                        working.push(message.clone());
                        extensions.push(message);
                    }
                    Some(CompletionChunk::Finished(reason)) => break reason,
                    Some(CompletionChunk::Error(error)) => {
                        return Err(BackendError::Stream(error).into());
                    }
                    None => {
                        return Err(BackendError::Malformed(
                            "stream ended without a finish reason".to_string(),
                        )
                        .into());
                    }
                }
            };

            if !reason.requires_continuation() {
                tracing::trace!(hub = %self.config.name, reason = ?reason, "Round finished");
                break;
            }
            if tool_rounds >= self.config.max_tool_rounds {
                tracing::warn!(
                    hub = %self.config.name,
                    session_id = %session_id,
                    limit = self.config.max_tool_rounds,
                    "Tool-call loop cap reached"
                );
                return Err(HubError::ToolLoopExceeded {
                    limit: self.config.max_tool_rounds,
                });
            }
            tool_rounds += 1;
            tracing::debug!(
                hub = %self.config.name,
                session_id = %session_id,
                round = tool_rounds,
                phase = %HubPhase::ToolCallPending,
                "Backend requested tool calls"
            );
        }

        if self.config.stream_response {
            if let Some(rest) = aggregator.finish() {
                sink.deliver(HubFrame::text(rest)).await?;
            }
            let stats = aggregator.stats();
            tracing::debug!(
                hub = %self.config.name,
                session_id = %session_id,
                chunks = stats.chunks_received,
                frames = stats.messages_emitted,
                "Stream aggregated"
            );
        } else if !text.is_empty() {
            sink.deliver(HubFrame::text(text.clone())).await?;
        }

        Ok(Completion {
            text,
            usage,
            extensions,
            tool_rounds,
        })
    }
}
