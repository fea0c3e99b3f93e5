//! Hub Core - Streaming Chat Orchestration
//!
//! This crate relays conversations between clients and a chat completion
//! backend in real time, and replays stored conversations to reconnecting
//! clients. It is independent of any transport: the host supplies a
//! [`DeliverySink`] per call and decides how frames reach the client.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Host (hub-daemon)                          │
//! │        connections ─▶ send_message / get_all_messages            │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                           HUB CORE                                │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │                        ChatHub                              │  │
//! │  │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │  │
//! │  │  │ Conversation │  │   Stream     │  │   Completion     │  │  │
//! │  │  │    Store     │  │  Aggregator  │  │    Backend       │  │  │
//! │  │  └──────────────┘  └──────┬───────┘  └──────────────────┘  │  │
//! │  └───────────────────────────┼────────────────────────────────┘  │
//! │                              ▼                                    │
//! │                        DeliverySink                               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ChatHub`]: One bot's orchestrator, parameterized by [`HubConfig`]
//! - [`ConversationStore`]: Expiring per-session conversation storage
//! - [`CompletionBackend`]: Streaming completion contract
//! - [`StreamAggregator`]: Chunk buffering with a flush threshold
//! - [`DeliverySink`]: Push target for [`HubFrame`]s
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use hub_core::{
//!     BackendConfig, ChannelSink, ChatHub, CompletionOptions, ConnectionId, HubConfig,
//!     OpenAiBackend,
//! };
//!
//! let backend = Arc::new(OpenAiBackend::new(
//!     BackendConfig::openai(api_key, "gpt-4o-mini"),
//!     CompletionOptions::default(),
//! )?);
//! let hub = ChatHub::with_memory_store(HubConfig::new("tech-support"), backend, 0);
//!
//! let (sink, mut frames) = ChannelSink::channel(ConnectionId::new(), 64);
//! let result = hub.send_message(&sink, "session-1", "Hello!").await?;
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Completion backend abstraction (OpenAI, Azure OpenAI)
//! - [`config`]: TOML/env/CLI configuration loading
//! - [`delivery`]: Delivery sinks
//! - [`error`]: Hub error taxonomy
//! - [`hub`]: The [`ChatHub`] orchestrator
//! - [`messages`]: Identifiers, roles and frames
//! - [`replay`]: Framed conversation replay
//! - [`session`]: Messages, conversations and sessions
//! - [`store`]: Conversation storage with sliding expiry
//! - [`streaming`]: Chunk aggregation

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod delivery;
pub mod error;
pub mod hub;
pub mod messages;
pub mod replay;
pub mod session;
pub mod store;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    AzureSearch, BackendConfig, BackendError, CompletionBackend, CompletionChunk,
    CompletionOptions, FinishReason, OpenAiBackend,
};
pub use delivery::{ChannelSink, DeliveryError, DeliverySink};
pub use error::HubError;
pub use hub::{ChatHub, HubConfig, HubPhase, StreamResult};
pub use messages::{ConnectionId, HubFrame, Role, SessionId, TokenUsage};
pub use replay::replay_conversation;
pub use session::{ChatMessage, Conversation, Session, SystemSlot};
pub use store::{
    spawn_sweeper, ConversationStore, MemoryConversationStore, SessionGuard, StoreConfig,
    StoreError,
};
pub use streaming::{AggregatorStats, StreamAggregator};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ChatHubToml, ConfigError,
    ConfigOverrides, ConfigSource, HubSettings, Provider,
};
