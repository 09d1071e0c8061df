//! TutorLink Server
//!
//! Real-time consultation sessions between students and teachers over
//! WebSocket, with a small REST surface for the synchronous paths.

mod auth;
mod connection;
mod engine;
mod error;
mod gateway;
mod http;
mod logging;
mod notify;
mod registry;
mod state;
mod store;
mod transition;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::IdentityVerifier;
use crate::engine::ProtocolEngine;
use crate::gateway::ws_handler;
use crate::notify::NotificationDispatcher;
use crate::registry::SessionRegistry;
use crate::state::AppState;
use crate::store::{create_store_channel, init_schema, StoreWriter};

#[derive(Parser, Debug)]
#[command(name = "tutorlink-server", about = "TutorLink consultation server")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 4000, env = "TUTORLINK_PORT")]
    port: u16,

    /// HMAC secret for verifying bearer credentials
    #[arg(long, env = "TUTORLINK_AUTH_SECRET")]
    auth_secret: String,

    /// Path to the SQLite database (defaults to ~/.tutorlink/tutorlink.db)
    #[arg(long, env = "TUTORLINK_DB_PATH")]
    db_path: Option<PathBuf>,
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".tutorlink").join("tutorlink.db")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _logging = logging::init_logging()?;

    let db_path = args.db_path.unwrap_or_else(default_db_path);
    init_schema(&db_path)?;

    // Durable writes go through a single batched writer task.
    let (store_tx, store_rx) = create_store_channel();
    tokio::spawn(StoreWriter::new(store_rx, db_path.clone()).run());

    let registry = Arc::new(SessionRegistry::new());
    let dispatcher = Arc::new(NotificationDispatcher::new());
    let engine = Arc::new(ProtocolEngine::new(
        registry,
        dispatcher,
        store_tx,
        db_path,
    ));

    let verifier = IdentityVerifier::new(&args.auth_secret);
    let state = Arc::new(AppState::new(engine, verifier));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(http::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    info!(
        component = "server",
        event = "server.listening",
        addr = %addr,
        "Listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
