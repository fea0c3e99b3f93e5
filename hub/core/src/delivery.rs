//! Delivery - Pushing Frames to Live Connections
//!
//! The hub never talks to a transport directly. It pushes [`HubFrame`]s into
//! a [`DeliverySink`] bound to the caller's connection, and the host decides
//! how those frames reach the client (socket, websocket, test harness).
//!
//! ```text
//!   ChatHub ───▶ ChannelSink (mpsc::Sender) ───▶ host writer task
//! ```
//!
//! A sink also reports when its connection has gone away, which is how an
//! in-flight call learns it should stop.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::{ConnectionId, HubFrame};

/// Errors from delivering frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection is gone
    #[error("Connection {0} is disconnected")]
    Disconnected(ConnectionId),
}

/// Push target for framed events
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// The connection this sink delivers to
    fn connection_id(&self) -> &ConnectionId;

    /// Deliver one frame, in order
    async fn deliver(&self, frame: HubFrame) -> Result<(), DeliveryError>;

    /// Resolves once the connection has closed
    ///
    /// Sinks that cannot observe their connection never resolve.
    async fn closed(&self) {
        std::future::pending::<()>().await;
    }
}

/// Sink backed by a bounded channel
///
/// The receiving half belongs to the host's writer. When it is dropped the
/// sink reports the connection closed.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    connection_id: ConnectionId,
    tx: mpsc::Sender<HubFrame>,
}

impl ChannelSink {
    /// Wrap a sender for `connection_id`
    #[must_use]
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<HubFrame>) -> Self {
        Self { connection_id, tx }
    }

    /// Create a sink and its receiving half
    #[must_use]
    pub fn channel(connection_id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<HubFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(connection_id, tx), rx)
    }

    /// Whether the receiving half is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl DeliverySink for ChannelSink {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    async fn deliver(&self, frame: HubFrame) -> Result<(), DeliveryError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| DeliveryError::Disconnected(self.connection_id.clone()))
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}
