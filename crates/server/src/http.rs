//! REST routes.
//!
//! The small synchronous surface next to the WebSocket protocol:
//! student-initiated cancel (pending only), post-completion feedback,
//! and a participant-only detail view. All routes require the same
//! bearer credential as the WebSocket handshake.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::auth::{extract_token, Identity};
use crate::error::ProtocolError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/consultations/{id}", get(get_consultation))
        .route("/api/consultations/{id}/cancel", post(cancel_consultation))
        .route("/api/consultations/{id}/feedback", post(leave_feedback))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackBody {
    feedback: String,
    #[serde(default)]
    rating: Option<u8>,
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, Response> {
    let auth_header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    let token = extract_token(auth_header, None)
        .map_err(|e| error_response(StatusCode::UNAUTHORIZED, "auth_error", &e.to_string()))?;
    state
        .verifier
        .verify(&token)
        .map_err(|e| error_response(StatusCode::UNAUTHORIZED, "auth_error", &e.to_string()))
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "success": false, "code": code, "message": message })),
    )
        .into_response()
}

fn protocol_error_response(e: ProtocolError) -> Response {
    let status = match e {
        ProtocolError::NotFound(_) => StatusCode::NOT_FOUND,
        ProtocolError::NotAuthorized(_) => StatusCode::FORBIDDEN,
        ProtocolError::InvalidState(_) => StatusCode::CONFLICT,
        ProtocolError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    debug!(
        component = "http",
        event = "http.request.rejected",
        code = e.code(),
        error = %e,
        "REST request rejected"
    );
    error_response(status, e.code(), &e.to_string())
}

async fn get_consultation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    match state.engine.detail(&identity.user_id, &id).await {
        Ok(consultation) => {
            Json(json!({ "success": true, "data": consultation })).into_response()
        }
        Err(e) => protocol_error_response(e),
    }
}

async fn cancel_consultation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    match state.engine.cancel(&identity.user_id, &id).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => protocol_error_response(e),
    }
}

async fn leave_feedback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FeedbackBody>,
) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    match state
        .engine
        .feedback(&identity.user_id, &id, body.feedback, body.rating)
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => protocol_error_response(e),
    }
}
