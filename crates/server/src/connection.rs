//! Connection handles.
//!
//! A `ConnectionHandle` identifies one authenticated transport-level
//! link. A single user may hold several simultaneous connections
//! (multi-device); every handle for that user must receive every event
//! addressed to the user. Handles are cheap to clone and delivery is
//! best-effort: a closed or full outbound channel is a per-connection
//! transport failure, never a protocol failure.

use tokio::sync::mpsc;
use tracing::debug;

use tutorlink_protocol::{Role, ServerEvent};

use crate::error::ProtocolError;

/// Frames queued for the per-connection writer task.
#[derive(Debug)]
pub enum OutboundFrame {
    /// JSON-serialized ServerEvent
    Event(ServerEvent),
    /// Raw pong response
    Pong(Vec<u8>),
}

/// One authenticated transport-level link.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    pub user_id: String,
    pub role: Role,
    outbound: mpsc::Sender<OutboundFrame>,
}

impl ConnectionHandle {
    pub fn new(
        conn_id: u64,
        user_id: String,
        role: Role,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            conn_id,
            user_id,
            role,
            outbound,
        }
    }

    /// Queue an event for this connection. Best-effort: failure means
    /// the client is gone (or hopelessly backed up) and is reported as
    /// a `Transport` error for the caller to log.
    pub fn deliver(&self, event: ServerEvent) -> Result<(), ProtocolError> {
        self.outbound.try_send(OutboundFrame::Event(event)).map_err(|e| {
            debug!(
                component = "connection",
                event = "connection.deliver_failed",
                connection_id = self.conn_id,
                user_id = %self.user_id,
                "Outbound channel unavailable: {e}"
            );
            ProtocolError::Transport(format!("connection {} unavailable", self.conn_id))
        })
    }

    /// Whether the writer side is gone.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}
