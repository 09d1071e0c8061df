//! Client → Server events

use serde::{Deserialize, Serialize};

use crate::types::ConsultationStatus;

/// Events sent from a client over the WebSocket. The `type` tag carries
/// the `consultation:*` event name; payload fields are camelCase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Student opens a new consultation request.
    #[serde(rename = "consultation:request", rename_all = "camelCase")]
    Request {
        teacher_id: String,
        subject: String,
        question: String,
    },

    /// Teacher accepts or rejects a pending consultation.
    #[serde(rename = "consultation:status", rename_all = "camelCase")]
    Status {
        consultation_id: String,
        status: ConsultationStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejection_reason: Option<String>,
    },

    /// Participant joins the consultation room.
    #[serde(rename = "consultation:join", rename_all = "camelCase")]
    Join { consultation_id: String },

    /// Participant sends a chat message.
    #[serde(rename = "consultation:message", rename_all = "camelCase")]
    Message {
        consultation_id: String,
        content: String,
    },

    /// Participant marks messages from the other party as read.
    #[serde(rename = "consultation:read", rename_all = "camelCase")]
    Read {
        consultation_id: String,
        message_ids: Vec<String>,
    },

    /// Teacher ends an accepted consultation.
    #[serde(rename = "consultation:end", rename_all = "camelCase")]
    End { consultation_id: String },
}
