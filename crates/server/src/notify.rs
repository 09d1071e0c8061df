//! Notification dispatcher — per-user personal channels.
//!
//! Every authenticated connection is registered under its user's
//! personal channel for the lifetime of the connection, making the user
//! reachable for status events before any room join. `notify_user`
//! fans out to every live device and silently no-ops when the user has
//! no connection (no offline queue in this core).

use dashmap::DashMap;
use tracing::{debug, warn};

use tutorlink_protocol::ServerEvent;

use crate::connection::ConnectionHandle;

#[derive(Default)]
pub struct NotificationDispatcher {
    channels: DashMap<String, Vec<ConnectionHandle>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its user's personal channel.
    /// Implicit on authenticate — called by the gateway right after
    /// handshake, before any client event is processed.
    pub fn register(&self, conn: ConnectionHandle) {
        let mut channel = self.channels.entry(conn.user_id.clone()).or_default();
        channel.retain(|c| c.conn_id != conn.conn_id);
        channel.push(conn);
    }

    /// Remove a connection on disconnect.
    pub fn unregister(&self, user_id: &str, conn_id: u64) {
        if let Some(mut channel) = self.channels.get_mut(user_id) {
            channel.retain(|c| c.conn_id != conn_id);
            let empty = channel.is_empty();
            drop(channel);
            if empty {
                self.channels.remove_if(user_id, |_, v| v.is_empty());
            }
        }
    }

    /// Deliver an event to every currently-connected device of a user.
    /// A failure on one device is logged and does not affect the rest.
    pub fn notify_user(&self, user_id: &str, event: ServerEvent) {
        let Some(channel) = self.channels.get(user_id) else {
            debug!(
                component = "notify",
                event = "notify.user.offline",
                user_id = %user_id,
                "No live connection for user, dropping notification"
            );
            return;
        };

        for conn in channel.iter() {
            if let Err(e) = conn.deliver(event.clone()) {
                warn!(
                    component = "notify",
                    event = "notify.deliver.failed",
                    user_id = %user_id,
                    connection_id = conn.conn_id,
                    error = %e,
                    "Failed to deliver notification to device"
                );
            }
        }
    }

    /// Number of live connections for a user (presence/observability only).
    pub fn connection_count(&self, user_id: &str) -> usize {
        self.channels.get(user_id).map(|c| c.len()).unwrap_or(0)
    }
}
