//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Role of an authenticated user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
}

/// Lifecycle status of a consultation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationStatus {
    Pending,
    Accepted,
    Rejected,
    Completed,
    Canceled,
}

impl ConsultationStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ConsultationStatus::Pending | ConsultationStatus::Accepted)
    }
}

/// A chat message within a consultation.
///
/// `timestamp` is server-assigned (millis since epoch) and strictly
/// increasing in insertion order within one consultation. `read` is the
/// only mutable field after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub content: String,
    pub timestamp: i64,
    pub read: bool,
}

/// One consultation between exactly one student and one teacher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consultation {
    pub id: String,
    pub student_id: String,
    pub teacher_id: String,
    pub subject: String,
    pub question: String,
    pub status: ConsultationStatus,
    /// Informational only; does not gate protocol behavior.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Consultation {
    /// Whether `user_id` is one of the two authorized participants.
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.student_id == user_id || self.teacher_id == user_id
    }

    /// Participant-facing view without the message log (for status
    /// notifications, where history is replayed separately on join).
    pub fn without_messages(&self) -> Consultation {
        Consultation {
            messages: Vec::new(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(!ConsultationStatus::Pending.is_terminal());
        assert!(!ConsultationStatus::Accepted.is_terminal());
        assert!(ConsultationStatus::Rejected.is_terminal());
        assert!(ConsultationStatus::Completed.is_terminal());
        assert!(ConsultationStatus::Canceled.is_terminal());
    }

    #[test]
    fn participant_check_covers_both_parties_only() {
        let c = Consultation {
            id: "c1".into(),
            student_id: "s1".into(),
            teacher_id: "t1".into(),
            subject: "math".into(),
            question: "need help".into(),
            status: ConsultationStatus::Pending,
            scheduled_time: None,
            messages: vec![],
            rejection_reason: None,
            feedback: None,
            rating: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(c.is_participant("s1"));
        assert!(c.is_participant("t1"));
        assert!(!c.is_participant("someone-else"));
    }
}
