//! Outbound delivery to live connections

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::game::{ConnectionId, Outgoing};

use super::protocol::ServerMsg;

/// Per-connection outbound buffer. A client that falls this far behind
/// starts losing messages instead of blocking the sender.
pub const OUTBOUND_BUFFER: usize = 64;

/// Maps live connections to their writer task's channel
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<ConnectionId, mpsc::Sender<ServerMsg>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and get the receiving end for its writer
    pub fn register(&self, id: ConnectionId) -> mpsc::Receiver<ServerMsg> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        self.connections.insert(id, tx);
        rx
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Stop accepting messages for a connection. Already queued messages
    /// are still flushed by the writer before the socket closes.
    pub fn close(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            debug!(conn = %id, "Connection closed by server");
        }
    }

    /// Queue a message without waiting. Failures are logged and dropped.
    pub fn deliver(&self, id: ConnectionId, msg: ServerMsg) {
        let Some(tx) = self.connections.get(&id).map(|tx| tx.value().clone()) else {
            debug!(conn = %id, "Dropping message for unknown connection");
            return;
        };

        match tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(conn = %id, "Outbound buffer full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn = %id, "Connection writer gone, dropping message");
            }
        }
    }

    /// Deliver everything a session handler produced
    pub fn dispatch(&self, outbox: Vec<Outgoing>) {
        for Outgoing { to, msg } in outbox {
            if let Some((last, rest)) = to.split_last() {
                for id in rest {
                    self.deliver(*id, msg.clone());
                }
                self.deliver(*last, msg);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
