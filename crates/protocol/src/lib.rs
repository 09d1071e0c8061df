//! TutorLink Protocol
//!
//! Shared types for communication between the consultation server and
//! its student/teacher clients. These types are serialized as JSON over
//! WebSocket, using the `consultation:*` event names.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::ClientEvent;
pub use server::ServerEvent;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
