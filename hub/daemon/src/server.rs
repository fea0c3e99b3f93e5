//! Daemon Server Implementation
//!
//! This module provides the server loop for the hub daemon:
//! - Accepts connections on a Unix socket
//! - Runs each request in its own task against the named hub
//! - Forwards hub frames to the client as JSON lines
//! - Cancels in-flight calls when their connection goes away
//! - Supports graceful shutdown
//!
//! ```text
//!                      DaemonServer
//!                           │
//!           ┌───────────────┼───────────────┐
//!           │               │               │
//!       (conn-1)        (conn-2)        (conn-3)
//!           │               │               │
//!           └───────┬───────┴───────┬───────┘
//!                   │               │
//!             ChatHub "a"     ChatHub "b"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use hub_core::{
    ChannelSink, ChatHub, CompletionBackend, ConnectionId, HubError, HubFrame, Role,
};

use crate::protocol::{ClientRequest, ServerMessage};

/// Hubs served by the daemon, by name
pub type HubMap<B> = HashMap<String, Arc<ChatHub<B>>>;

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: std::time::Instant,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Per-connection outbound channel capacity
    pub connection_channel_capacity: usize,
    /// Per-request frame channel capacity
    pub frame_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connection_channel_capacity: 256,
            frame_capacity: 64,
        }
    }
}

/// The main daemon server
pub struct DaemonServer<B: CompletionBackend + 'static> {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Server configuration
    server_config: ServerConfig,
    /// Hubs by name
    hubs: Arc<HubMap<B>>,
    /// Active connection state
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl<B: CompletionBackend + 'static> DaemonServer<B> {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf, hubs: HubMap<B>) -> Self {
        Self {
            socket_path,
            server_config: ServerConfig::default(),
            hubs: Arc::new(hubs),
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Run the accept loop until `shutdown` is set
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        info!(path = ?self.socket_path, hubs = self.hubs.len(), "Listening for connections");

        // Owner-only socket
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let accept_result =
                tokio::time::timeout(tokio::time::Duration::from_millis(100), listener.accept())
                    .await;

            let stream = match accept_result {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::new();
            info!(
                conn_id = %conn_id,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let task_handle = tokio::spawn(
                handle_connection(
                    conn_id.clone(),
                    stream,
                    Arc::clone(&self.hubs),
                    Arc::clone(&self.connection_states),
                    self.server_config.clone(),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: std::time::Instant::now(),
                    abort_handle: task_handle.abort_handle(),
                },
            );
        }

        self.shutdown().await
    }

    /// Graceful shutdown
    async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self
            .connection_states
            .iter()
            .map(|r| r.key().clone())
            .collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id = %conn_id,
                    uptime_secs = conn_state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                conn_state.abort_handle.abort();
            }
        }

        // Give aborted handlers a moment to unwind
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Serve one client connection
///
/// Requests are read line by line and each runs in its own task. All output
/// funnels through one channel so lines never interleave mid-write. When the
/// connection ends that channel closes, which cancels every call still in
/// flight for it.
async fn handle_connection<B: CompletionBackend + 'static>(
    conn_id: ConnectionId,
    stream: UnixStream,
    hubs: Arc<HubMap<B>>,
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    config: ServerConfig,
) {
    info!("Connection handler started");

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(config.connection_channel_capacity);
    let mut requests = JoinSet::new();

    let _ = out_tx.send(ServerMessage::connected(&conn_id)).await;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match ClientRequest::parse(&line) {
                            Ok(request) => {
                                debug!(request = ?request, "Received request");
                                requests.spawn(
                                    handle_request(
                                        Arc::clone(&hubs),
                                        conn_id.clone(),
                                        request,
                                        out_tx.clone(),
                                        config.frame_capacity,
                                    )
                                    .in_current_span(),
                                );
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to parse request");
                                // Sent from a task: this loop is the only reader of out_rx
                                let message = ServerMessage::error(None, format!("Invalid request: {e}"));
                                let out = out_tx.clone();
                                requests.spawn(async move {
                                    let _ = out.send(message).await;
                                });
                            }
                        }
                    }
                    Ok(None) => {
                        info!("Client disconnected (EOF)");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Read error");
                        break;
                    }
                }
            }

            msg = out_rx.recv() => {
                let Some(message) = msg else { break };
                match message.to_line() {
                    Ok(line) => {
                        if let Err(e) = write_half.write_all(line.as_bytes()).await {
                            error!(error = %e, "Write error");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode message"),
                }
            }

            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Request task failed");
                }
            }
        }
    }

    // Closing the outbound channel cancels in-flight calls
    drop(out_rx);
    while requests.join_next().await.is_some() {}

    connection_states.remove(&conn_id);

    info!(
        active_connections = connection_states.len(),
        "Connection handler finished"
    );
}

/// Run one request to completion
async fn handle_request<B: CompletionBackend + 'static>(
    hubs: Arc<HubMap<B>>,
    conn_id: ConnectionId,
    request: ClientRequest,
    out: mpsc::Sender<ServerMessage>,
    frame_capacity: usize,
) {
    let hub_name = request.hub().to_string();
    let Some(hub) = hubs.get(&hub_name).cloned() else {
        warn!(hub = %hub_name, "Request for unknown hub");
        let _ = out
            .send(ServerMessage::error(
                Some(&hub_name),
                format!("Unknown hub '{hub_name}'"),
            ))
            .await;
        return;
    };

    let (sink, frames) = ChannelSink::channel(conn_id, frame_capacity);

    let (result, open_turn) = match request {
        ClientRequest::SendMessage {
            session_id,
            message,
            ..
        } => {
            tokio::join!(
                async move {
                    hub.send_message(&sink, &session_id, &message)
                        .await
                        .map(|result| {
                            debug!(
                                hub = %hub.name(),
                                total_tokens = result.total_tokens,
                                tool_rounds = result.tool_rounds,
                                "Message handled"
                            );
                        })
                },
                forward_frames(&hub_name, frames, &out),
            )
        }
        ClientRequest::GetAllMessages { session_id, .. } => {
            tokio::join!(
                async move {
                    hub.get_all_messages(&sink, &session_id)
                        .await
                        .map(|turns| debug!(hub = %hub.name(), turns = turns, "Replay handled"))
                },
                forward_frames(&hub_name, frames, &out),
            )
        }
    };

    match result {
        Ok(()) => {}
        Err(HubError::Cancelled) => debug!(hub = %hub_name, "Request cancelled"),
        Err(e) => {
            warn!(hub = %hub_name, error = %e, "Request failed");
            let _ = out
                .send(ServerMessage::error(Some(&hub_name), e.to_string()))
                .await;
            if open_turn {
                let _ = out
                    .send(ServerMessage::frame(
                        &hub_name,
                        &HubFrame::end(Role::Assistant),
                    ))
                    .await;
            }
        }
    }
}

/// Pump frames from one call to the connection's outbound channel
///
/// Returns whether a turn was left open (a Start with no End). Returning
/// drops `frames`, which the call observes as a closed sink.
async fn forward_frames(
    hub: &str,
    mut frames: mpsc::Receiver<HubFrame>,
    out: &mpsc::Sender<ServerMessage>,
) -> bool {
    let mut open_turn = false;
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            () = out.closed() => return open_turn,
        };
        let Some(frame) = frame else {
            return open_turn;
        };

        match frame {
            HubFrame::Start { .. } => open_turn = true,
            HubFrame::End { .. } => open_turn = false,
            HubFrame::Text { .. } => {}
        }

        if out.send(ServerMessage::frame(hub, &frame)).await.is_err() {
            return open_turn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use hub_core::{BackendError, ChatMessage, CompletionChunk, FinishReason, HubConfig};
    use serde_json::Value;
    use tokio::io::Lines;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

    /// Replies "Hi" then "!" unless the last user message is "fail"
    struct EchoBackend;

    #[async_trait]
    impl CompletionBackend for EchoBackend {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn stream_completion(
            &self,
            messages: &[ChatMessage],
        ) -> Result<mpsc::Receiver<CompletionChunk>, BackendError> {
            let fail = messages.last().is_some_and(|m| m.text == "fail");
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx.send(CompletionChunk::Text("Hi".to_string())).await;
                if fail {
                    let _ = tx.send(CompletionChunk::Error("boom".to_string())).await;
                    return;
                }
                let _ = tx.send(CompletionChunk::Text("!".to_string())).await;
                let _ = tx
                    .send(CompletionChunk::Finished(FinishReason::Stop))
                    .await;
            });
            Ok(rx)
        }
    }

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(path: &std::path::Path) -> Self {
            let mut attempts = 0;
            let stream = loop {
                match UnixStream::connect(path).await {
                    Ok(stream) => break stream,
                    Err(_) if attempts < 50 => {
                        attempts += 1;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Err(e) => panic!("connect failed: {e}"),
                }
            };
            let (read_half, writer) = stream.into_split();
            Self {
                lines: BufReader::new(read_half).lines(),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for line")
                .unwrap()
                .expect("connection closed");
            serde_json::from_str(&line).unwrap()
        }

        /// Read `n` lines and return their `data` fields
        async fn recv_data(&mut self, n: usize) -> Vec<String> {
            let mut out = Vec::new();
            for _ in 0..n {
                let msg = self.recv().await;
                out.push(msg["data"].as_str().unwrap_or_default().to_string());
            }
            out
        }
    }

    fn start_server(dir: &tempfile::TempDir) -> (PathBuf, Arc<AtomicBool>) {
        start_server_with(dir, ServerConfig::default())
    }

    fn start_server_with(
        dir: &tempfile::TempDir,
        server_config: ServerConfig,
    ) -> (PathBuf, Arc<AtomicBool>) {
        let socket_path = dir.path().join("hub.sock");
        let mut hubs = HubMap::new();
        hubs.insert(
            "echo".to_string(),
            Arc::new(ChatHub::with_memory_store(
                HubConfig::new("echo"),
                Arc::new(EchoBackend),
                0,
            )),
        );
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut server = DaemonServer::new(socket_path.clone(), hubs);
        server.server_config = server_config;
        let flag = Arc::clone(&shutdown);
        tokio::spawn(async move { server.run(flag).await });
        (socket_path, shutdown)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.connection_channel_capacity, 256);
        assert_eq!(config.frame_capacity, 64);
    }

    #[tokio::test]
    async fn test_send_and_replay_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, shutdown) = start_server(&dir);
        let mut client = Client::connect(&socket_path).await;

        let hello = client.recv().await;
        assert_eq!(hello["type"], "connected");

        client
            .send(r#"{"op":"send_message","hub":"echo","session_id":"s1","message":"hello"}"#)
            .await;
        assert_eq!(
            client.recv_data(4).await,
            vec!["StartAssistantResponse", "Hi", "!", "EndAssistantResponse"]
        );

        client
            .send(r#"{"op":"get_all_messages","hub":"echo","session_id":"s1"}"#)
            .await;
        assert_eq!(
            client.recv_data(6).await,
            vec![
                "StartUserResponse",
                "hello",
                "EndUserResponse",
                "StartAssistantResponse",
                "Hi!",
                "EndAssistantResponse"
            ]
        );

        shutdown.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_blank_session_uses_connection_id() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, shutdown) = start_server(&dir);
        let mut client = Client::connect(&socket_path).await;

        let hello = client.recv().await;
        let conn_id = hello["connection_id"].as_str().unwrap().to_string();

        client
            .send(r#"{"op":"send_message","hub":"echo","message":"mine"}"#)
            .await;
        client.recv_data(4).await;

        // A second connection can read it back by id
        let mut other = Client::connect(&socket_path).await;
        other.recv().await;
        other
            .send(&format!(
                r#"{{"op":"get_all_messages","hub":"echo","session_id":"{conn_id}"}}"#
            ))
            .await;
        let replay = other.recv_data(6).await;
        assert_eq!(replay[1], "mine");

        shutdown.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_failure_sends_error_then_end() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, shutdown) = start_server(&dir);
        let mut client = Client::connect(&socket_path).await;
        client.recv().await;

        client
            .send(r#"{"op":"send_message","hub":"echo","session_id":"s1","message":"fail"}"#)
            .await;
        assert_eq!(client.recv_data(2).await, vec!["StartAssistantResponse", "Hi"]);

        let error = client.recv().await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["hub"], "echo");

        let end = client.recv().await;
        assert_eq!(end["data"], "EndAssistantResponse");

        shutdown.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_unknown_hub_and_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, shutdown) = start_server(&dir);
        let mut client = Client::connect(&socket_path).await;
        client.recv().await;

        client
            .send(r#"{"op":"get_all_messages","hub":"nope"}"#)
            .await;
        let error = client.recv().await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["hub"], "nope");

        client.send("{broken").await;
        let error = client.recv().await;
        assert_eq!(error["type"], "error");
        assert!(error.get("hub").is_none());

        shutdown.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_burst_of_bad_lines_with_tiny_outbound_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (socket_path, shutdown) = start_server_with(
            &dir,
            ServerConfig {
                connection_channel_capacity: 1,
                ..ServerConfig::default()
            },
        );
        let mut client = Client::connect(&socket_path).await;

        client.send("{bad\n{bad\n{bad\n{bad\n{bad").await;

        assert_eq!(client.recv().await["type"], "connected");
        for _ in 0..5 {
            assert_eq!(client.recv().await["type"], "error");
        }

        shutdown.store(true, Ordering::SeqCst);
    }
}
