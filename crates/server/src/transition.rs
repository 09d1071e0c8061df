//! Pure state-machine guards.
//!
//! All status-edge and authorization logic lives here as synchronous,
//! IO-free functions over the consultation record: `guard(record,
//! caller, action) -> Result<(), ProtocolError>`. The engine actor
//! applies side effects (persist, broadcast) only after a guard passes,
//! so the whole decision table is unit-testable without a transport.

use tutorlink_protocol::{Consultation, ConsultationStatus};

use crate::error::ProtocolError;

/// A protocol action evaluated against the consultation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Reject,
    Cancel,
    Join,
    Message,
    Read,
    End,
    Feedback,
}

/// Whether `from -> to` is an edge of the lifecycle state machine.
pub fn is_valid_edge(from: ConsultationStatus, to: ConsultationStatus) -> bool {
    use ConsultationStatus::*;
    matches!(
        (from, to),
        (Pending, Accepted) | (Pending, Rejected) | (Pending, Canceled) | (Accepted, Completed)
    )
}

/// Evaluate an action for a caller against the current record.
/// Passing the guard never mutates anything; failing it must leave the
/// record untouched by the caller.
pub fn guard(record: &Consultation, caller_id: &str, action: Action) -> Result<(), ProtocolError> {
    match action {
        Action::Accept | Action::Reject => {
            if record.teacher_id != caller_id {
                return Err(ProtocolError::NotAuthorized(
                    "only the consultation's teacher may update its status".into(),
                ));
            }
            require_status(record, ConsultationStatus::Pending, action)
        }

        Action::Cancel => {
            if record.student_id != caller_id {
                return Err(ProtocolError::NotAuthorized(
                    "only the requesting student may cancel".into(),
                ));
            }
            require_status(record, ConsultationStatus::Pending, action)
        }

        Action::Join | Action::Message | Action::Read => {
            if !record.is_participant(caller_id) {
                return Err(ProtocolError::NotAuthorized(
                    "not a participant of this consultation".into(),
                ));
            }
            require_status(record, ConsultationStatus::Accepted, action)
        }

        Action::End => {
            if record.teacher_id != caller_id {
                return Err(ProtocolError::NotAuthorized(
                    "only the teacher may end the consultation".into(),
                ));
            }
            require_status(record, ConsultationStatus::Accepted, action)
        }

        Action::Feedback => {
            if record.student_id != caller_id {
                return Err(ProtocolError::NotAuthorized(
                    "only the student may leave feedback".into(),
                ));
            }
            require_status(record, ConsultationStatus::Completed, action)
        }
    }
}

fn require_status(
    record: &Consultation,
    expected: ConsultationStatus,
    action: Action,
) -> Result<(), ProtocolError> {
    if record.status == expected {
        Ok(())
    } else {
        Err(ProtocolError::InvalidState(format!(
            "{:?} requires status {:?}, consultation is {:?}",
            action, expected, record.status
        )))
    }
}
