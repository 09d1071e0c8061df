//! Session registry — in-memory room membership.
//!
//! Maps a consultation id to the set of connections currently joined to
//! its room. Purely ephemeral: rebuilt from nothing on restart, and the
//! authoritative message history is replayed from the store on join.
//! Membership reads are lock-free and may be momentarily stale; the
//! registry is never consulted to authorize a mutation.

use dashmap::DashMap;
use tracing::debug;

use crate::connection::ConnectionHandle;

#[derive(Default)]
pub struct SessionRegistry {
    rooms: DashMap<String, Vec<ConnectionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room. Re-joining replaces the stale entry
    /// for the same connection id.
    pub fn join_room(&self, consultation_id: &str, conn: ConnectionHandle) {
        let mut room = self.rooms.entry(consultation_id.to_string()).or_default();
        room.retain(|c| c.conn_id != conn.conn_id);
        debug!(
            component = "registry",
            event = "registry.room.joined",
            consultation_id = %consultation_id,
            connection_id = conn.conn_id,
            user_id = %conn.user_id,
            "Connection joined room"
        );
        room.push(conn);
    }

    /// Remove one connection from a room, dropping the room when empty.
    pub fn leave_room(&self, consultation_id: &str, conn_id: u64) {
        if let Some(mut room) = self.rooms.get_mut(consultation_id) {
            room.retain(|c| c.conn_id != conn_id);
            let empty = room.is_empty();
            drop(room);
            if empty {
                self.rooms.remove_if(consultation_id, |_, v| v.is_empty());
            }
        }
    }

    /// Current connections in a room (snapshot, eventually consistent).
    pub fn connections_in_room(&self, consultation_id: &str) -> Vec<ConnectionHandle> {
        self.rooms
            .get(consultation_id)
            .map(|room| room.iter().filter(|c| !c.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a specific connection has joined the room.
    pub fn is_in_room(&self, consultation_id: &str, conn_id: u64) -> bool {
        self.rooms
            .get(consultation_id)
            .map(|room| room.iter().any(|c| c.conn_id == conn_id))
            .unwrap_or(false)
    }

    /// Tear down a room entirely (consultation ended).
    pub fn remove_room(&self, consultation_id: &str) {
        self.rooms.remove(consultation_id);
        debug!(
            component = "registry",
            event = "registry.room.removed",
            consultation_id = %consultation_id,
            "Room torn down"
        );
    }
}
