//! Hub Daemon - Streaming Chat Server
//!
//! Hosts one or more named chat hubs behind a Unix socket. Clients send
//! newline-delimited JSON requests and receive framed replies as they stream
//! from the completion backend.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults ($XDG_CONFIG_HOME/chat-hub/hub.toml + env)
//! hub-daemon
//!
//! # Custom socket path and config file
//! hub-daemon --socket-path /tmp/hub.sock --config ./hub.toml
//!
//! # Override the model from the command line
//! OPENAI_API_KEY=sk-... hub-daemon --model gpt-4o
//!
//! # Verbose logging
//! RUST_LOG=debug hub-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod protocol;
mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use hub_core::{
    default_config_path, load_config_from_path, spawn_sweeper, ChatHub, CompletionBackend,
    ConfigOverrides, OpenAiBackend, Provider,
};

use server::{DaemonServer, HubMap};

/// Hub Daemon - streaming chat orchestration over a Unix socket
#[derive(Parser, Debug)]
#[command(name = "hub-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, env = "HUB_SOCKET", value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "HUB_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Completion provider (openai, azure)
    #[arg(long, value_name = "PROVIDER")]
    provider: Option<Provider>,

    /// Model name (OpenAI only)
    #[arg(short = 'm', long, value_name = "MODEL")]
    model: Option<String>,

    /// OpenAI-compatible base URL
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Maximum live sessions per hub (0 = unbounded)
    #[arg(long, value_name = "N")]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "HUB_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// CLI overrides layered over file and env configuration
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(provider) = self.provider {
            overrides = overrides.with_provider(provider);
        }
        if let Some(ref model) = self.model {
            overrides = overrides.with_model(model.clone());
        }
        if let Some(ref url) = self.base_url {
            overrides = overrides.with_base_url(url.clone());
        }
        if let Some(max_sessions) = self.max_sessions {
            overrides = overrides.with_max_sessions(max_sessions);
        }
        overrides
    }
}

/// Get the default socket path
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise the system temp directory
fn default_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map_or_else(|_| std::env::temp_dir(), PathBuf::from)
        .join("chat-hub")
        .join("hub.sock")
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("hub_daemon={level},hub_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Hub Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    // Configuration: file < env < CLI
    let config_path = args.config.clone().or_else(default_config_path);
    let mut settings =
        load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut settings);
    settings.validate().context("Invalid configuration")?;

    info!(
        source = %settings.source(),
        provider = ?settings.backend.provider,
        hubs = settings.hubs.len(),
        max_sessions = settings.max_sessions,
        "Configuration loaded"
    );

    let backend = Arc::new(
        OpenAiBackend::new(
            settings.backend.backend_config(),
            settings.backend.completion_options(),
        )
        .context("Failed to create completion backend")?,
    );
    if backend.health_check().await {
        info!(backend = backend.name(), "Backend reachable");
    } else {
        warn!(backend = backend.name(), "Backend health check failed, continuing anyway");
    }

    // One hub per configured bot, each with its own store and sweeper
    let mut hubs = HubMap::new();
    for config in &settings.hubs {
        let hub = ChatHub::with_memory_store(
            config.clone(),
            Arc::clone(&backend),
            settings.max_sessions,
        );
        spawn_sweeper(Arc::clone(hub.store()), settings.sweep_interval);
        info!(
            hub = %config.name,
            streaming = config.stream_response,
            buffer = config.stream_buffer_threshold,
            expiry_secs = config.sliding_expiration.as_secs(),
            "Hub ready"
        );
        hubs.insert(config.name.clone(), Arc::new(hub));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let shutdown_clone = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let socket_path = args.socket_path.unwrap_or_else(default_socket_path);
    info!(socket_path = ?socket_path, "Socket path");

    let mut server = DaemonServer::new(socket_path, hubs);
    match server.run(shutdown).await {
        Ok(()) => {
            info!("Hub daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "hub-daemon",
            "--provider",
            "azure",
            "--model",
            "gpt-4o",
            "--max-sessions",
            "50",
        ]);
        let mut settings = hub_core::HubSettings::default();
        args.overrides().apply(&mut settings);

        assert_eq!(settings.backend.provider, Provider::Azure);
        assert_eq!(settings.backend.model.as_deref(), Some("gpt-4o"));
        assert_eq!(settings.max_sessions, 50);
        assert_eq!(settings.source(), hub_core::ConfigSource::Cli);
    }

    #[test]
    fn test_rejects_unknown_provider() {
        assert!(Args::try_parse_from(["hub-daemon", "--provider", "llama"]).is_err());
    }

    #[test]
    fn test_default_socket_path_file_name() {
        assert!(default_socket_path().ends_with("chat-hub/hub.sock"));
    }
}
