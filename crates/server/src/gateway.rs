//! Connection gateway — WebSocket handling.
//!
//! Authenticates the handshake, runs the per-connection writer task,
//! reads client events, and dispatches them to the protocol engine.
//! A connection with no inbound frame within the heartbeat window is
//! forcibly disconnected. Disconnect cleanup releases room membership
//! and the personal channel only — never session store state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tutorlink_protocol::{ClientEvent, ServerEvent};

use crate::auth::{extract_token, Identity};
use crate::connection::{ConnectionHandle, OutboundFrame};
use crate::state::AppState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// No inbound frame (event, ping, or pong) within this window means the
/// client is gone; the connection is forcibly closed and cleaned up.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

const OUTBOUND_BUFFER: usize = 100;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// WebSocket upgrade handler. The credential is verified before the
/// upgrade completes; a bad token never yields a live connection.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let auth_header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    let query_string = query.token.as_ref().map(|t| format!("token={t}"));

    let token = match extract_token(auth_header, query_string.as_deref()) {
        Ok(token) => token,
        Err(e) => {
            info!(
                component = "gateway",
                event = "ws.handshake.rejected",
                error = %e,
                "Handshake rejected: no credential"
            );
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let identity = match state.verifier.verify(&token) {
        Ok(identity) => identity,
        Err(e) => {
            info!(
                component = "gateway",
                event = "ws.handshake.rejected",
                error = %e,
                "Handshake rejected: bad credential"
            );
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// Handle one authenticated WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "gateway",
        event = "ws.connection.opened",
        connection_id = conn_id,
        user_id = %identity.user_id,
        role = ?identity.role,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Per-connection writer task; everything outbound funnels through it.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_BUFFER);
    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let result = match frame {
                OutboundFrame::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        warn!(
                            component = "gateway",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server event"
                        );
                        continue;
                    }
                },
                OutboundFrame::Pong(data) => ws_tx.send(Message::Pong(data.into())).await,
            };

            if result.is_err() {
                debug!(
                    component = "gateway",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let conn = ConnectionHandle::new(
        conn_id,
        identity.user_id.clone(),
        identity.role,
        outbound_tx.clone(),
    );

    // Every connection is reachable via its user's personal channel for
    // the whole connection lifetime.
    state.engine.dispatcher().register(conn.clone());

    // Rooms this connection has joined, for disconnect cleanup.
    let mut joined_rooms: HashSet<String> = HashSet::new();

    loop {
        let frame = match tokio::time::timeout(HEARTBEAT_TIMEOUT, ws_rx.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                info!(
                    component = "gateway",
                    event = "ws.connection.heartbeat_timeout",
                    connection_id = conn_id,
                    user_id = %identity.user_id,
                    "No heartbeat within window, forcing disconnect"
                );
                break;
            }
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(data))) => {
                let _ = outbound_tx.send(OutboundFrame::Pong(data.to_vec())).await;
                continue;
            }
            Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) => {
                info!(
                    component = "gateway",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(
                    component = "gateway",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            None => break,
        };

        let event: ClientEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    component = "gateway",
                    event = "ws.event.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = text.len(),
                    "Failed to parse client event"
                );
                let _ = conn.deliver(ServerEvent::Error {
                    code: "parse_error".into(),
                    message: e.to_string(),
                });
                continue;
            }
        };

        handle_client_event(event, &conn, &state, &mut joined_rooms).await;
    }

    // Cleanup: release room membership and the personal channel. A
    // disconnect is not a cancellation — the session store is untouched.
    for room in &joined_rooms {
        state.engine.registry().leave_room(room, conn_id);
    }
    state
        .engine
        .dispatcher()
        .unregister(&identity.user_id, conn_id);

    info!(
        component = "gateway",
        event = "ws.connection.closed",
        connection_id = conn_id,
        user_id = %identity.user_id,
        rooms_left = joined_rooms.len(),
        "WebSocket connection closed"
    );
    send_task.abort();
}

/// Dispatch one client event to the engine. Failures are answered only
/// to this connection as an `error` event; they never reach the room.
async fn handle_client_event(
    event: ClientEvent,
    conn: &ConnectionHandle,
    state: &Arc<AppState>,
    joined_rooms: &mut HashSet<String>,
) {
    debug!(
        component = "gateway",
        event = "ws.event.received",
        connection_id = conn.conn_id,
        user_id = %conn.user_id,
        payload = ?event,
        "Received client event"
    );

    let result = match event {
        ClientEvent::Request {
            teacher_id,
            subject,
            question,
        } => match state
            .engine
            .request(conn, teacher_id, subject, question)
            .await
        {
            Ok(consultation) => {
                // Ack the requesting student with the created record.
                let _ = conn.deliver(ServerEvent::Status { consultation });
                Ok(())
            }
            Err(e) => Err(e),
        },

        ClientEvent::Status {
            consultation_id,
            status,
            rejection_reason,
        } => {
            state
                .engine
                .set_status(conn.clone(), &consultation_id, status, rejection_reason)
                .await
        }

        ClientEvent::Join { consultation_id } => {
            let result = state.engine.join(conn.clone(), &consultation_id).await;
            if result.is_ok() {
                joined_rooms.insert(consultation_id);
            }
            result
        }

        ClientEvent::Message {
            consultation_id,
            content,
        } => {
            state
                .engine
                .message(conn.clone(), &consultation_id, content)
                .await
        }

        ClientEvent::Read {
            consultation_id,
            message_ids,
        } => {
            state
                .engine
                .read(conn.clone(), &consultation_id, message_ids)
                .await
        }

        ClientEvent::End { consultation_id } => {
            state.engine.end(conn.clone(), &consultation_id).await
        }
    };

    if let Err(e) = result {
        debug!(
            component = "gateway",
            event = "ws.event.rejected",
            connection_id = conn.conn_id,
            code = e.code(),
            error = %e,
            "Client event rejected"
        );
        let _ = conn.deliver(ServerEvent::Error {
            code: e.code().into(),
            message: e.to_string(),
        });
    }
}
