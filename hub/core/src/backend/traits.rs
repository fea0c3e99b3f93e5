//! Completion Backend Traits
//!
//! The streaming contract between the hub and a language-model backend.
//!
//! # Design Philosophy
//!
//! A backend turns an ordered message list into a channel of
//! [`CompletionChunk`]s. The hub only relies on this contract: how the
//! backend talks to its provider (HTTP, SSE, local inference) stays inside
//! the implementation. Each call gets its own channel, so concurrent calls
//! never share stream state.
//!
//! Every well-formed stream ends with exactly one [`CompletionChunk::Finished`]
//! or [`CompletionChunk::Error`]. A channel that closes before either is a
//! malformed stream.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::TokenUsage;
use crate::session::ChatMessage;

/// Default OpenAI API base URL
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default chat model
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default Azure OpenAI API version
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";

/// Chunk events from completion backends
#[derive(Clone, Debug, PartialEq)]
pub enum CompletionChunk {
    /// Incremental response text
    Text(String),
    /// Cumulative token usage for the request so far
    Usage(TokenUsage),
    /// A message the backend appends to the conversation before continuing
    /// (an assistant tool-call request, or a tool result)
    Extend(ChatMessage),
    /// The round ended
    Finished(FinishReason),
    /// The stream failed
    Error(String),
}

/// Why a completion round ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of the response
    Stop,
    /// Token limit reached
    Length,
    /// Output withheld by the provider's filter
    ContentFilter,
    /// The model requested tool calls; another round is needed
    ToolCalls,
    /// Provider-specific reason
    Other(String),
}

impl FinishReason {
    /// Parse a provider `finish_reason` string
    #[must_use]
    pub fn parse(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            "tool_calls" | "function_call" | "tool_use" => Self::ToolCalls,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the hub must invoke the backend again
    #[must_use]
    pub fn requires_continuation(&self) -> bool {
        matches!(self, Self::ToolCalls)
    }
}

/// Errors from completion backends
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The request could not be sent
    #[error("Backend request failed: {0}")]
    Request(String),

    /// The provider answered with a non-success status
    #[error("Backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The provider reported an error mid-stream
    #[error("Backend stream error: {0}")]
    Stream(String),

    /// The stream violated the chunk contract
    #[error("Malformed backend stream: {0}")]
    Malformed(String),
}

/// Completion backend trait
///
/// Implement this trait to add support for different providers.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Get the backend name (e.g., "OpenAI", "Azure OpenAI")
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Start a streaming completion for `messages`
    ///
    /// Returns a channel receiver that yields chunks as they arrive. Dropping
    /// the receiver cancels the request.
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<CompletionChunk>, BackendError>;
}

#[async_trait]
impl<B: CompletionBackend + ?Sized> CompletionBackend for Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn health_check(&self) -> bool {
        (**self).health_check().await
    }

    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<CompletionChunk>, BackendError> {
        (**self).stream_completion(messages).await
    }
}

/// Sampling options sent with every request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionOptions {
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Nucleus sampling mass
    pub top_p: Option<f32>,
    /// Frequency penalty
    pub frequency_penalty: Option<f32>,
    /// Presence penalty
    pub presence_penalty: Option<f32>,
    /// Maximum output tokens
    pub max_tokens: Option<u32>,
}

impl CompletionOptions {
    /// Defaults used for Azure deployments
    #[must_use]
    pub fn azure_defaults() -> Self {
        Self {
            temperature: Some(0.7),
            top_p: Some(0.95),
            frequency_penalty: Some(0.0),
            presence_penalty: Some(0.0),
            max_tokens: Some(800),
        }
    }
}

/// Azure AI Search index used to ground Azure replies in your own data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AzureSearch {
    /// Search service endpoint
    pub endpoint: String,
    /// Search service key
    pub key: String,
    /// Index name
    pub index: String,
}

impl AzureSearch {
    /// Build from settings, or `None` unless all three are non-blank
    #[must_use]
    pub fn from_parts(endpoint: &str, key: &str, index: &str) -> Option<Self> {
        if [endpoint, key, index].iter().any(|part| part.trim().is_empty()) {
            return None;
        }
        Some(Self {
            endpoint: endpoint.to_string(),
            key: key.to_string(),
            index: index.to_string(),
        })
    }
}

/// Backend connection configuration
#[derive(Clone, Debug, PartialEq)]
pub enum BackendConfig {
    /// OpenAI or any OpenAI-compatible endpoint
    OpenAi {
        /// API key for bearer authentication
        api_key: String,
        /// Custom base URL (optional)
        base_url: Option<String>,
        /// Model identifier
        model: String,
    },
    /// Azure OpenAI deployment
    Azure {
        /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`
        endpoint: String,
        /// Resource key
        api_key: String,
        /// Deployment name
        deployment: String,
        /// REST API version
        api_version: String,
        /// Optional search index data source
        search: Option<AzureSearch>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::OpenAi {
            api_key: String::new(),
            base_url: None,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl BackendConfig {
    /// Create OpenAI configuration
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::OpenAi {
            api_key: api_key.into(),
            base_url: None,
            model: model.into(),
        }
    }

    /// Create Azure configuration
    pub fn azure(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        deployment: impl Into<String>,
    ) -> Self {
        Self::Azure {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            deployment: deployment.into(),
            api_version: DEFAULT_AZURE_API_VERSION.to_string(),
            search: None,
        }
    }

    /// Ground Azure replies in a search index (no effect on OpenAI)
    #[must_use]
    pub fn with_azure_search(mut self, index: Option<AzureSearch>) -> Self {
        if let Self::Azure { search, .. } = &mut self {
            *search = index;
        }
        self
    }

    /// Human-readable provider name
    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "OpenAI",
            Self::Azure { .. } => "Azure OpenAI",
        }
    }

    /// Required settings that are blank
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self {
            Self::OpenAi { api_key, model, .. } => {
                if api_key.trim().is_empty() {
                    missing.push("OpenAI API key is required.");
                }
                if model.trim().is_empty() {
                    missing.push("OpenAI model is required.");
                }
            }
            Self::Azure {
                endpoint,
                api_key,
                deployment,
                ..
            } => {
                if endpoint.trim().is_empty() {
                    missing.push("Azure OpenAI endpoint is required.");
                }
                if api_key.trim().is_empty() {
                    missing.push("Azure OpenAI key is required.");
                }
                if deployment.trim().is_empty() {
                    missing.push("Deployment name is required.");
                }
            }
        }
        missing
    }
}
