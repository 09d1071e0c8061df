//! Shared application state

use std::sync::Arc;

use crate::auth::IdentityVerifier;
use crate::engine::ProtocolEngine;

/// State shared by the WebSocket gateway and the REST handlers.
pub struct AppState {
    pub engine: Arc<ProtocolEngine>,
    pub verifier: IdentityVerifier,
}

impl AppState {
    pub fn new(engine: Arc<ProtocolEngine>, verifier: IdentityVerifier) -> Self {
        Self { engine, verifier }
    }
}
