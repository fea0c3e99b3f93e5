//! TOML Configuration File Support
//!
//! This module provides centralized configuration loading for chat hubs,
//! supporting a TOML configuration file at `~/.config/chat-hub/hub.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (see [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [backend]
//! provider = "azure"
//! endpoint = "https://my-resource.openai.azure.com"
//! deployment = "gpt-4o-mini"
//! temperature = 0.7
//!
//! [store]
//! max_sessions = 10000
//! sweep_interval_secs = 60
//!
//! # Ground replies in an Azure AI Search index (all three or none)
//! search_endpoint = "https://my-search.search.windows.net"
//! search_index = "product-docs"
//!
//! [hubs.tech-support]
//! system_message = "You are a patient technical support agent."
//! stream_message_buffer = 5
//!
//! [hubs.joke-bot]
//! system_message = "You answer everything with a joke."
//! stream_response = false
//! sliding_expiration_secs = 600
//! ```
//!
//! Credentials normally come from the environment (`OPENAI_API_KEY`,
//! `AZURE_OPENAI_KEY`, `AZURE_SEARCH_KEY`) rather than the file. Each
//! provider's variables are read whichever provider is selected, so a CLI
//! `--provider` switch still finds them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{
    AzureSearch, BackendConfig, CompletionOptions, DEFAULT_AZURE_API_VERSION, DEFAULT_MODEL,
};
use crate::hub::HubConfig;

/// Default interval between expired-session sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Name of the hub created when the file defines none
pub const DEFAULT_HUB_NAME: &str = "default";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Required backend credentials or endpoint are missing
    #[error("Missing backend configuration: {0}")]
    MissingCredential(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Completion provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// OpenAI or an OpenAI-compatible server
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// Azure OpenAI deployment
    Azure,
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azure" | "azure-openai" => Ok(Self::Azure),
            other => Err(ConfigError::ValidationError(format!(
                "unknown provider '{other}' (expected 'openai' or 'azure')"
            ))),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// `openai` or `azure`
    pub provider: Option<Provider>,
    /// API key (prefer the environment)
    pub api_key: Option<String>,
    /// OpenAI-compatible base URL
    pub base_url: Option<String>,
    /// OpenAI model
    pub model: Option<String>,
    /// Azure resource endpoint
    pub endpoint: Option<String>,
    /// Azure deployment name
    pub deployment: Option<String>,
    /// Azure API version
    pub api_version: Option<String>,
    /// Azure AI Search endpoint
    pub search_endpoint: Option<String>,
    /// Azure AI Search key
    pub search_key: Option<String>,
    /// Azure AI Search index
    pub search_index: Option<String>,
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

/// Store section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Maximum live sessions per hub (0 = unlimited)
    pub max_sessions: Option<usize>,
    /// Seconds between expired-session sweeps
    pub sweep_interval_secs: Option<u64>,
}

/// One `[hubs.<name>]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubToml {
    /// System message
    pub system_message: Option<String>,
    /// Stream the reply as it arrives
    pub stream_response: Option<bool>,
    /// Aggregation threshold
    pub stream_message_buffer: Option<usize>,
    /// Idle window in seconds
    pub sliding_expiration_secs: Option<u64>,
    /// Tool-call round cap
    pub max_tool_rounds: Option<u32>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatHubToml {
    /// Backend configuration section
    pub backend: BackendToml,
    /// Store configuration section
    pub store: StoreToml,
    /// Hub sections keyed by bot name
    pub hubs: BTreeMap<String, HubToml>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Backend settings before they are resolved into a [`BackendConfig`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendSettings {
    /// Which provider to talk to
    pub provider: Provider,
    /// OpenAI API key
    pub openai_api_key: String,
    /// Azure OpenAI resource key
    pub azure_api_key: String,
    /// OpenAI-compatible base URL
    pub base_url: Option<String>,
    /// OpenAI model
    pub model: Option<String>,
    /// Azure resource endpoint
    pub endpoint: String,
    /// Azure deployment name
    pub deployment: String,
    /// Azure API version
    pub api_version: Option<String>,
    /// Azure AI Search endpoint
    pub search_endpoint: String,
    /// Azure AI Search key
    pub search_key: String,
    /// Azure AI Search index
    pub search_index: String,
    /// Explicit sampling options
    pub options: CompletionOptions,
}

impl BackendSettings {
    /// Resolve into a backend configuration
    #[must_use]
    pub fn backend_config(&self) -> BackendConfig {
        match self.provider {
            Provider::OpenAi => BackendConfig::OpenAi {
                api_key: self.openai_api_key.clone(),
                base_url: self.base_url.clone(),
                model: self
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            },
            Provider::Azure => BackendConfig::Azure {
                endpoint: self.endpoint.clone(),
                api_key: self.azure_api_key.clone(),
                deployment: self.deployment.clone(),
                api_version: self
                    .api_version
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
                search: AzureSearch::from_parts(
                    &self.search_endpoint,
                    &self.search_key,
                    &self.search_index,
                ),
            },
        }
    }

    /// Sampling options with provider defaults filled in
    #[must_use]
    pub fn completion_options(&self) -> CompletionOptions {
        let defaults = match self.provider {
            Provider::OpenAi => CompletionOptions::default(),
            Provider::Azure => CompletionOptions::azure_defaults(),
        };
        CompletionOptions {
            temperature: self.options.temperature.or(defaults.temperature),
            top_p: self.options.top_p.or(defaults.top_p),
            frequency_penalty: self.options.frequency_penalty.or(defaults.frequency_penalty),
            presence_penalty: self.options.presence_penalty.or(defaults.presence_penalty),
            max_tokens: self.options.max_tokens.or(defaults.max_tokens),
        }
    }
}

/// Centralized configuration for the hub host
///
/// Use [`load_config`] to load configuration with proper priority handling,
/// then [`HubSettings::validate`] before building anything from it.
#[derive(Clone, Debug)]
pub struct HubSettings {
    /// Backend settings
    pub backend: BackendSettings,
    /// Hub configurations, one per bot
    pub hubs: Vec<HubConfig>,
    /// Maximum live sessions per hub (0 = unlimited)
    pub max_sessions: usize,
    /// Interval between expired-session sweeps
    pub sweep_interval: Duration,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            backend: BackendSettings::default(),
            hubs: vec![HubConfig::new(DEFAULT_HUB_NAME)],
            max_sessions: 0,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl HubSettings {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Look up a hub by name
    #[must_use]
    pub fn hub(&self, name: &str) -> Option<&HubConfig> {
        self.hubs.iter().find(|hub| hub.name == name)
    }

    /// Check that the configuration can start a host
    ///
    /// Every missing credential is reported in one error.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingCredential`] when backend settings are blank,
    /// [`ConfigError::ValidationError`] for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = self.backend.backend_config().missing_fields();
        if !missing.is_empty() {
            return Err(ConfigError::MissingCredential(missing.join(" ")));
        }
        if self.hubs.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one hub must be configured".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(hub) = self.hubs.iter().find(|hub| hub.sliding_expiration.is_zero()) {
            return Err(ConfigError::ValidationError(format!(
                "hub '{}': sliding_expiration_secs must be greater than zero",
                hub.name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-hub/hub.toml` or
/// `~/.config/chat-hub/hub.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-hub").join("hub.toml"))
}

/// Load configuration from all sources with proper priority
///
/// CLI overrides are not handled here; apply [`ConfigOverrides`] afterwards.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<HubSettings, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<HubSettings, ConfigError> {
    let mut config = load_file_config(path)?;
    apply_env_config(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Defaults plus the TOML file, without environment overrides
fn load_file_config(path: Option<PathBuf>) -> Result<HubSettings, ConfigError> {
    let mut config = HubSettings::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ChatHubToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                hubs = config.hubs.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut HubSettings, toml: &ChatHubToml) {
    let backend = &mut config.backend;
    if let Some(provider) = toml.backend.provider {
        backend.provider = provider;
    }
    if let Some(ref key) = toml.backend.api_key {
        backend.openai_api_key = key.clone();
        backend.azure_api_key = key.clone();
    }
    if toml.backend.base_url.is_some() {
        backend.base_url = toml.backend.base_url.clone();
    }
    if toml.backend.model.is_some() {
        backend.model = toml.backend.model.clone();
    }
    if let Some(ref endpoint) = toml.backend.endpoint {
        backend.endpoint = endpoint.clone();
    }
    if let Some(ref deployment) = toml.backend.deployment {
        backend.deployment = deployment.clone();
    }
    if toml.backend.api_version.is_some() {
        backend.api_version = toml.backend.api_version.clone();
    }
    if let Some(ref endpoint) = toml.backend.search_endpoint {
        backend.search_endpoint = endpoint.clone();
    }
    if let Some(ref key) = toml.backend.search_key {
        backend.search_key = key.clone();
    }
    if let Some(ref index) = toml.backend.search_index {
        backend.search_index = index.clone();
    }
    backend.options = CompletionOptions {
        temperature: toml.backend.temperature,
        top_p: toml.backend.top_p,
        frequency_penalty: toml.backend.frequency_penalty,
        presence_penalty: toml.backend.presence_penalty,
        max_tokens: toml.backend.max_tokens,
    };

    if let Some(max_sessions) = toml.store.max_sessions {
        config.max_sessions = max_sessions;
    }
    if let Some(secs) = toml.store.sweep_interval_secs {
        config.sweep_interval = Duration::from_secs(secs);
    }

    if !toml.hubs.is_empty() {
        config.hubs = toml
            .hubs
            .iter()
            .map(|(name, section)| hub_from_toml(name, section))
            .collect();
    }
}

/// Build one hub configuration from its section
fn hub_from_toml(name: &str, section: &HubToml) -> HubConfig {
    let mut hub = HubConfig::new(name);
    if let Some(ref text) = section.system_message {
        hub.system_message = text.clone();
    }
    if let Some(stream) = section.stream_response {
        hub.stream_response = stream;
    }
    if let Some(threshold) = section.stream_message_buffer {
        hub.stream_buffer_threshold = threshold;
    }
    if let Some(secs) = section.sliding_expiration_secs {
        hub.sliding_expiration = Duration::from_secs(secs);
    }
    if let Some(rounds) = section.max_tool_rounds {
        hub.max_tool_rounds = rounds;
    }
    hub
}

/// Apply environment variable overrides to the config
///
/// `lookup` reads one variable; the loader passes `std::env::var`.
fn apply_env_config(
    config: &mut HubSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let backend = &mut config.backend;

    if let Some(provider) = lookup("HUB_PROVIDER") {
        backend.provider = provider.parse()?;
        config.source = ConfigSource::Env;
    }

    // Both providers are read so a later provider override finds its settings
    let string_vars: [(&str, &mut String); 7] = [
        ("OPENAI_API_KEY", &mut backend.openai_api_key),
        ("AZURE_OPENAI_ENDPOINT", &mut backend.endpoint),
        ("AZURE_OPENAI_KEY", &mut backend.azure_api_key),
        ("AZURE_OPENAI_DEPLOYMENT", &mut backend.deployment),
        ("AZURE_SEARCH_ENDPOINT", &mut backend.search_endpoint),
        ("AZURE_SEARCH_KEY", &mut backend.search_key),
        ("AZURE_SEARCH_INDEX", &mut backend.search_index),
    ];
    for (key, slot) in string_vars {
        if let Some(value) = lookup(key) {
            *slot = value;
            config.source = ConfigSource::Env;
        }
    }

    let optional_vars: [(&str, &mut Option<String>); 3] = [
        ("OPENAI_BASE_URL", &mut backend.base_url),
        ("OPENAI_MODEL", &mut backend.model),
        ("AZURE_OPENAI_API_VERSION", &mut backend.api_version),
    ];
    for (key, slot) in optional_vars {
        if let Some(value) = lookup(key) {
            *slot = Some(value);
            config.source = ConfigSource::Env;
        }
    }

    if let Some(max_sessions) = lookup("HUB_MAX_SESSIONS") {
        if let Ok(n) = max_sessions.parse::<usize>() {
            config.max_sessions = n;
            config.source = ConfigSource::Env;
        }
    }

    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Provider override
    pub provider: Option<Provider>,
    /// Model override
    pub model: Option<String>,
    /// Base URL override
    pub base_url: Option<String>,
    /// Session capacity override
    pub max_sessions: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set provider override
    #[must_use]
    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set session capacity override
    #[must_use]
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = Some(max_sessions);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut HubSettings) {
        if self.provider.is_some()
            || self.model.is_some()
            || self.base_url.is_some()
            || self.max_sessions.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(provider) = self.provider {
            config.backend.provider = provider;
        }
        if let Some(ref model) = self.model {
            config.backend.model = Some(model.clone());
        }
        if let Some(ref url) = self.base_url {
            config.backend.base_url = Some(url.clone());
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
