//! Server → Client events

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, Consultation};

/// Events pushed from the server to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A new consultation request landed on the teacher's personal channel.
    #[serde(rename = "consultation:new", rename_all = "camelCase")]
    New { consultation: Consultation },

    /// The consultation was accepted; both sides may now join the room.
    #[serde(rename = "consultation:ready", rename_all = "camelCase")]
    Ready { consultation: Consultation },

    /// Status changed (currently: rejection notice to the student).
    #[serde(rename = "consultation:status", rename_all = "camelCase")]
    Status { consultation: Consultation },

    /// Full ordered message log, replayed to a connection on join.
    #[serde(rename = "consultation:history", rename_all = "camelCase")]
    History { messages: Vec<ChatMessage> },

    /// A chat message, broadcast to every connection in the room.
    #[serde(rename = "consultation:message", rename_all = "camelCase")]
    Message { message: ChatMessage },

    /// Messages the other participant just marked read.
    #[serde(rename = "consultation:read", rename_all = "camelCase")]
    Read { message_ids: Vec<String> },

    /// The teacher ended the consultation; the room is torn down.
    #[serde(rename = "consultation:ended", rename_all = "camelCase")]
    Ended { consultation: Consultation },

    /// Delivered only to the connection whose event failed.
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConsultationStatus;

    fn consultation() -> Consultation {
        Consultation {
            id: "c1".into(),
            student_id: "s1".into(),
            teacher_id: "t1".into(),
            subject: "math".into(),
            question: "limits".into(),
            status: ConsultationStatus::Accepted,
            scheduled_time: None,
            messages: vec![],
            rejection_reason: None,
            feedback: None,
            rating: None,
            created_at: 1,
            updated_at: 2,
        }
    }

    #[test]
    fn ready_event_wire_shape() {
        let json = serde_json::to_string(&ServerEvent::Ready {
            consultation: consultation(),
        })
        .expect("serialize");
        assert!(json.contains(r#""type":"consultation:ready""#));
        assert!(json.contains(r#""studentId":"s1""#));
        assert!(json.contains(r#""status":"accepted""#));
    }

    #[test]
    fn error_event_is_flat() {
        let json = serde_json::to_string(&ServerEvent::Error {
            code: "invalid_state".into(),
            message: "consultation is pending".into(),
        })
        .expect("serialize");
        let reparsed: ServerEvent = serde_json::from_str(&json).expect("deserialize");
        match reparsed {
            ServerEvent::Error { code, .. } => assert_eq!(code, "invalid_state"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn history_event_preserves_order() {
        let msgs = vec![
            ChatMessage {
                id: "m1".into(),
                sender_id: "s1".into(),
                content: "hi".into(),
                timestamp: 10,
                read: false,
            },
            ChatMessage {
                id: "m2".into(),
                sender_id: "t1".into(),
                content: "hello".into(),
                timestamp: 11,
                read: true,
            },
        ];
        let json = serde_json::to_string(&ServerEvent::History { messages: msgs }).expect("serialize");
        let reparsed: ServerEvent = serde_json::from_str(&json).expect("deserialize");
        match reparsed {
            ServerEvent::History { messages } => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].id, "m1");
                assert_eq!(messages[1].timestamp, 11);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
