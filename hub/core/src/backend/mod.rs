//! Completion Backend Integration
//!
//! This module provides abstracted access to chat completion providers
//! through a common trait interface.
//!
//! # Available Backends
//!
//! - **OpenAI**: api.openai.com or any OpenAI-compatible server
//! - **Azure OpenAI**: a deployment on an Azure OpenAI resource
//!
//! # Usage
//!
//! ```ignore
//! use hub_core::backend::{BackendConfig, CompletionBackend, CompletionOptions, OpenAiBackend};
//!
//! let backend = OpenAiBackend::new(
//!     BackendConfig::openai(api_key, "gpt-4o-mini"),
//!     CompletionOptions::default(),
//! )?;
//! let mut rx = backend.stream_completion(&messages).await?;
//! ```

mod openai;
mod traits;

pub use openai::OpenAiBackend;
pub use traits::{
    AzureSearch, BackendConfig, BackendError, CompletionBackend, CompletionChunk,
    CompletionOptions, FinishReason, DEFAULT_AZURE_API_VERSION, DEFAULT_MODEL,
    DEFAULT_OPENAI_BASE_URL,
};
