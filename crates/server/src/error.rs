//! Protocol error taxonomy.
//!
//! Every failed event maps to one of these variants. They are returned
//! only to the originating connection as an `error` event (or an HTTP
//! status on the REST routes) and never broadcast. None of them mutate
//! the session store.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Authenticated, but not a participant or wrong role for the event.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The event is illegal in the consultation's current status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Unknown consultation id.
    #[error("consultation {0} not found")]
    NotFound(String),

    /// Send failure to a specific connection. Logged per connection,
    /// never rolls back persistence or blocks other deliveries.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProtocolError {
    /// Stable wire code for the `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::NotAuthorized(_) => "not_authorized",
            ProtocolError::InvalidState(_) => "invalid_state",
            ProtocolError::NotFound(_) => "not_found",
            ProtocolError::Transport(_) => "transport_error",
        }
    }
}
