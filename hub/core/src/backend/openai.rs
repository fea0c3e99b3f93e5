//! OpenAI Backend Implementation
//!
//! Completion backend for OpenAI and Azure OpenAI chat completions.
//!
//! # Chat Completions API
//!
//! Both providers share the same streaming wire format:
//! - `POST .../chat/completions` with `"stream": true`
//! - Server-sent events, one JSON chunk per `data:` line
//! - A terminal `data: [DONE]`
//!
//! With `stream_options.include_usage` the provider sends one extra chunk
//! carrying token usage after the chunk that holds `finish_reason`, so the
//! round is only reported finished at `[DONE]` (or end of body).

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::traits::{
    BackendConfig, BackendError, CompletionBackend, CompletionChunk, CompletionOptions,
    FinishReason, DEFAULT_OPENAI_BASE_URL,
};
use crate::messages::{Role, TokenUsage};
use crate::session::ChatMessage;

/// Stream channel capacity
const CHANNEL_CAPACITY: usize = 100;

/// OpenAI / Azure OpenAI backend client
#[derive(Clone)]
pub struct OpenAiBackend {
    /// Provider connection settings
    config: BackendConfig,
    /// Sampling options sent with every request
    options: CompletionOptions,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OpenAiBackend {
    /// Create a backend for `config`
    pub fn new(config: BackendConfig, options: CompletionOptions) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;

        Ok(Self {
            config,
            options,
            http_client,
        })
    }

    /// Provider connection settings
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Chat completions endpoint URL
    fn completions_url(&self) -> String {
        match &self.config {
            BackendConfig::OpenAi { base_url, .. } => format!(
                "{}/chat/completions",
                base_url
                    .as_deref()
                    .unwrap_or(DEFAULT_OPENAI_BASE_URL)
                    .trim_end_matches('/')
            ),
            BackendConfig::Azure {
                endpoint,
                deployment,
                api_version,
                ..
            } => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
        }
    }

    /// Models endpoint URL, used for health checks
    fn models_url(&self) -> String {
        match &self.config {
            BackendConfig::OpenAi { base_url, .. } => format!(
                "{}/models",
                base_url
                    .as_deref()
                    .unwrap_or(DEFAULT_OPENAI_BASE_URL)
                    .trim_end_matches('/')
            ),
            BackendConfig::Azure {
                endpoint,
                api_version,
                ..
            } => format!(
                "{}/openai/models?api-version={}",
                endpoint.trim_end_matches('/'),
                api_version
            ),
        }
    }

    /// Attach provider credentials
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config {
            BackendConfig::OpenAi { api_key, .. } => request.bearer_auth(api_key),
            BackendConfig::Azure { api_key, .. } => request.header("api-key", api_key),
        }
    }

    /// Build the JSON request body
    fn build_body(&self, messages: &[ChatMessage]) -> Value {
        let answered = answered_tool_calls(messages);
        let mut body = json!({
            "messages": messages
                .iter()
                .filter_map(|message| message_to_json(message, &answered))
                .collect::<Vec<_>>(),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        match &self.config {
            BackendConfig::OpenAi { model, .. } => body["model"] = json!(model),
            BackendConfig::Azure {
                search: Some(search),
                ..
            } => {
                body["data_sources"] = json!([{
                    "type": "azure_search",
                    "parameters": {
                        "endpoint": search.endpoint,
                        "index_name": search.index,
                        "authentication": { "type": "api_key", "key": search.key },
                    },
                }]);
            }
            BackendConfig::Azure { .. } => {}
        }
        if let Some(temperature) = self.options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = self.options.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(penalty) = self.options.frequency_penalty {
            body["frequency_penalty"] = json!(penalty);
        }
        if let Some(penalty) = self.options.presence_penalty {
            body["presence_penalty"] = json!(penalty);
        }
        if let Some(max_tokens) = self.options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        body
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &str {
        self.config.provider_name()
    }

    async fn health_check(&self) -> bool {
        self.authorize(self.http_client.get(self.models_url()))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<CompletionChunk>, BackendError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let response = self
            .authorize(self.http_client.post(self.completions_url()))
            .json(&self.build_body(messages))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }

        let mut events = response.bytes_stream().eventsource();

        tokio::spawn(async move {
            let mut state = StreamState::default();

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        let _ = tx.send(CompletionChunk::Error(e.to_string())).await;
                        return;
                    }
                };

                match state.handle_data(&event.data) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                // Receiver dropped, stop streaming
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(CompletionChunk::Error(e.to_string())).await;
                        return;
                    }
                }

                if state.is_done() {
                    break;
                }
            }

            for chunk in state.finish() {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

/// Ids of tool calls that have a result message
fn answered_tool_calls(messages: &[ChatMessage]) -> HashSet<&str> {
    messages
        .iter()
        .filter(|message| message.role == Role::Tool)
        .filter_map(|message| message.tool_payload.as_ref()?.get("tool_call_id")?.as_str())
        .collect()
}

/// Convert a stored message to the chat completions shape
///
/// Object payloads (`tool_calls`, `tool_call_id`) are merged into the message.
/// Tool calls with no result are dropped, since the API rejects them, and an
/// assistant tool-call message left empty is skipped.
fn message_to_json(message: &ChatMessage, answered: &HashSet<&str>) -> Option<Value> {
    let mut value = json!({
        "role": message.role.as_str(),
        "content": message.text,
    });

    let Some(Value::Object(extra)) = &message.tool_payload else {
        return Some(value);
    };
    for (key, field) in extra {
        value[key.as_str()] = field.clone();
    }

    let unanswered = match value.get_mut("tool_calls") {
        Some(Value::Array(calls)) => {
            calls.retain(|call| {
                call.get("id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| answered.contains(id))
            });
            calls.is_empty()
        }
        _ => false,
    };
    if unanswered {
        if let Some(object) = value.as_object_mut() {
            object.remove("tool_calls");
        }
    }

    if message.role == Role::Assistant && message.text.is_empty() {
        if value.get("tool_calls").is_none() {
            tracing::debug!("Skipping assistant tool-call message with no results");
            return None;
        }
        value["content"] = Value::Null;
    }

    Some(value)
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

// ============================================================================
// Stream state
// ============================================================================

/// Tool call assembled from streamed fragments
#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Per-request parse state
#[derive(Debug, Default)]
struct StreamState {
    finish_reason: Option<FinishReason>,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    done: bool,
}

impl StreamState {
    fn is_done(&self) -> bool {
        self.done
    }

    /// Handle one SSE `data` payload
    fn handle_data(&mut self, data: &str) -> Result<Vec<CompletionChunk>, BackendError> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(Vec::new());
        }

        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| BackendError::Malformed(format!("invalid chunk: {e}")))?;

        if let Some(error) = chunk.error {
            return Err(BackendError::Stream(error.message));
        }

        let mut out = Vec::new();
        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    out.push(CompletionChunk::Text(content));
                }
                for call in delta.tool_calls.unwrap_or_default() {
                    let entry = self.tool_calls.entry(call.index).or_default();
                    if let Some(id) = call.id {
                        entry.id = Some(id);
                    }
                    if let Some(function) = call.function {
                        if let Some(name) = function.name {
                            entry.name = Some(name);
                        }
                        if let Some(arguments) = function.arguments {
                            entry.arguments.push_str(&arguments);
                        }
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(FinishReason::parse(&reason));
            }
        }

        if let Some(usage) = chunk.usage {
            out.push(CompletionChunk::Usage(TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }));
        }

        Ok(out)
    }

    /// Chunks that close the round
    fn finish(&mut self) -> Vec<CompletionChunk> {
        let reason = match self.finish_reason.take() {
            Some(reason) => reason,
            None if self.done => FinishReason::Stop,
            None => {
                return vec![CompletionChunk::Error(
                    "stream ended without a finish reason".to_string(),
                )]
            }
        };

        let mut out = Vec::new();
        if reason.requires_continuation() {
            let calls: Vec<Value> = std::mem::take(&mut self.tool_calls)
                .into_values()
                .filter_map(|call| {
                    Some(json!({
                        "id": call.id?,
                        "type": "function",
                        "function": { "name": call.name?, "arguments": call.arguments },
                    }))
                })
                .collect();
            if !calls.is_empty() {
                out.push(CompletionChunk::Extend(
                    ChatMessage::assistant("").with_tool_payload(json!({ "tool_calls": calls })),
                ));
            }
        }
        out.push(CompletionChunk::Finished(reason));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AzureSearch;
    use pretty_assertions::assert_eq;

    fn backend(config: BackendConfig) -> OpenAiBackend {
        OpenAiBackend::new(config, CompletionOptions::default()).unwrap()
    }

    #[test]
    fn test_completions_url() {
        let openai = backend(BackendConfig::openai("sk", "gpt-4o-mini"));
        assert_eq!(
            openai.completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );

        let custom = backend(BackendConfig::OpenAi {
            api_key: "sk".to_string(),
            base_url: Some("http://localhost:8080/v1/".to_string()),
            model: "local".to_string(),
        });
        assert_eq!(
            custom.completions_url(),
            "http://localhost:8080/v1/chat/completions"
        );

        let azure = backend(BackendConfig::azure(
            "https://res.openai.azure.com/",
            "key",
            "chat",
        ));
        assert_eq!(
            azure.completions_url(),
            "https://res.openai.azure.com/openai/deployments/chat/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn test_build_body() {
        let openai = OpenAiBackend::new(
            BackendConfig::openai("sk", "gpt-4o-mini"),
            CompletionOptions {
                max_tokens: Some(64),
                ..CompletionOptions::default()
            },
        )
        .unwrap();

        let body = openai.build_body(&[ChatMessage::system("sys"), ChatMessage::user("hi")]);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 64);
        assert!(body.get("temperature").is_none());
        assert_eq!(
            body["messages"],
            json!([
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "hi"},
            ])
        );

        let azure = OpenAiBackend::new(
            BackendConfig::azure("https://res", "key", "chat"),
            CompletionOptions::azure_defaults(),
        )
        .unwrap();
        let body = azure.build_body(&[ChatMessage::user("hi")]);
        assert!(body.get("model").is_none());
        assert_eq!(body["max_tokens"], 800);
    }

    #[test]
    fn test_message_to_json_merges_tool_payload() {
        let request = ChatMessage::assistant("").with_tool_payload(json!({
            "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "f", "arguments": "{}"}}]
        }));
        let result = ChatMessage::tool("42", json!({"tool_call_id": "c1"}));
        let answered = answered_tool_calls(std::slice::from_ref(&result));

        let value = message_to_json(&request, &answered).unwrap();
        assert_eq!(value["role"], "assistant");
        assert!(value["content"].is_null());
        assert_eq!(value["tool_calls"][0]["id"], "c1");

        let value = message_to_json(&result, &answered).unwrap();
        assert_eq!(value, json!({"role": "tool", "content": "42", "tool_call_id": "c1"}));
    }

    #[test]
    fn test_unanswered_tool_calls_are_not_sent() {
        let openai = backend(BackendConfig::openai("sk", "gpt-4o-mini"));
        let body = openai.build_body(&[
            ChatMessage::user("weather?"),
            ChatMessage::assistant("").with_tool_payload(json!({
                "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "f", "arguments": "{}"}},
                    {"id": "c2", "type": "function", "function": {"name": "g", "arguments": "{}"}},
                ]
            })),
            ChatMessage::tool("sunny", json!({"tool_call_id": "c1"})),
            ChatMessage::assistant("").with_tool_payload(json!({
                "tool_calls": [{"id": "c3", "type": "function", "function": {"name": "h", "arguments": "{}"}}]
            })),
        ]);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["tool_calls"].as_array().unwrap().len(), 1);
        assert_eq!(messages[1]["tool_calls"][0]["id"], "c1");
        assert_eq!(messages[2]["role"], "tool");
    }

    #[test]
    fn test_azure_search_data_source() {
        let config = BackendConfig::azure("https://res", "key", "chat").with_azure_search(
            AzureSearch::from_parts("https://search.example", "search-key", "docs"),
        );
        let body = backend(config).build_body(&[ChatMessage::user("hi")]);
        assert_eq!(
            body["data_sources"],
            json!([{
                "type": "azure_search",
                "parameters": {
                    "endpoint": "https://search.example",
                    "index_name": "docs",
                    "authentication": {"type": "api_key", "key": "search-key"},
                },
            }])
        );

        let plain = backend(BackendConfig::azure("https://res", "key", "chat"));
        assert!(plain.build_body(&[ChatMessage::user("hi")]).get("data_sources").is_none());
    }

    #[test]
    fn test_stream_state_text_then_usage_then_done() {
        let mut state = StreamState::default();

        let chunks = state
            .handle_data(r#"{"choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(chunks, vec![CompletionChunk::Text("Hel".to_string())]);

        let chunks = state
            .handle_data(r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#)
            .unwrap();
        assert_eq!(chunks, vec![CompletionChunk::Text("lo".to_string())]);

        let chunks = state
            .handle_data(
                r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
            )
            .unwrap();
        assert_eq!(
            chunks,
            vec![CompletionChunk::Usage(TokenUsage {
                input_tokens: 5,
                output_tokens: 2,
                total_tokens: 7,
            })]
        );

        assert!(state.handle_data("[DONE]").unwrap().is_empty());
        assert!(state.is_done());
        assert_eq!(
            state.finish(),
            vec![CompletionChunk::Finished(FinishReason::Stop)]
        );
    }

    #[test]
    fn test_stream_state_accumulates_tool_calls() {
        let mut state = StreamState::default();
        state
            .handle_data(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"lookup","arguments":"{\"q\""}}]}}]}"#,
            )
            .unwrap();
        state
            .handle_data(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\"rust\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            )
            .unwrap();
        state.handle_data("[DONE]").unwrap();

        let chunks = state.finish();
        assert_eq!(chunks.len(), 2);
        match &chunks[0] {
            CompletionChunk::Extend(message) => {
                assert_eq!(message.role, Role::Assistant);
                let payload = message.tool_payload.as_ref().unwrap();
                assert_eq!(payload["tool_calls"][0]["id"], "call_1");
                assert_eq!(payload["tool_calls"][0]["function"]["name"], "lookup");
                assert_eq!(
                    payload["tool_calls"][0]["function"]["arguments"],
                    r#"{"q":"rust"}"#
                );
            }
            other => panic!("Expected Extend, got {other:?}"),
        }
        assert_eq!(chunks[1], CompletionChunk::Finished(FinishReason::ToolCalls));
    }

    #[test]
    fn test_stream_state_error_payload() {
        let mut state = StreamState::default();
        let err = state
            .handle_data(r#"{"error":{"message":"rate limited"}}"#)
            .unwrap_err();
        assert_eq!(err, BackendError::Stream("rate limited".to_string()));
    }

    #[test]
    fn test_stream_state_invalid_json() {
        let mut state = StreamState::default();
        assert!(matches!(
            state.handle_data("{not json"),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn test_stream_ending_without_finish_is_error() {
        let mut state = StreamState::default();
        state
            .handle_data(r#"{"choices":[{"delta":{"content":"partial"}}]}"#)
            .unwrap();
        assert!(matches!(
            state.finish().as_slice(),
            [CompletionChunk::Error(_)]
        ));
    }

    #[test]
    fn test_finish_reason_without_done_still_finishes() {
        let mut state = StreamState::default();
        state
            .handle_data(r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#)
            .unwrap();
        assert_eq!(
            state.finish(),
            vec![CompletionChunk::Finished(FinishReason::Length)]
        );
    }
}
