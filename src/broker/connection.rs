//! Broker-side view of one client connection
//!
//! `Connection` holds the sending half of the per-connection channel drained
//! by the transport's writer task. The broker never writes to sockets directly.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::topic::ConnectionId;

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub sender: UnboundedSender<WsMessage>,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    /// Create a connection with a fresh UUID id.
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), sender)
    }

    pub fn with_id(id: impl Into<ConnectionId>, sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: id.into(),
            sender,
            connected_at: Utc::now(),
        }
    }

    /// Queue a frame for the writer task. Fails once the writer is gone.
    pub fn send(&self, message: WsMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}
