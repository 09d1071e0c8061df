//! Protocol engine — one actor task per consultation.
//!
//! Each consultation runs as an independent tokio task owning the
//! authoritative record. Callers communicate via `ConsultationHandle`,
//! which sends `ConsultationCommand` messages over an mpsc channel —
//! the channel is the per-session serializer, so two simultaneous
//! mutating events on the same consultation can never race, while
//! different consultations proceed fully in parallel. Lock-free record
//! snapshots go through `ArcSwap` for read paths (REST detail view).
//!
//! Order of effects for every mutation: guard → record mutation →
//! store write → broadcast. Broadcast is best-effort per connection and
//! never rolls anything back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use tutorlink_protocol::{
    new_id, ChatMessage, Consultation, ConsultationStatus, Role, ServerEvent,
};

use crate::connection::ConnectionHandle;
use crate::error::ProtocolError;
use crate::notify::NotificationDispatcher;
use crate::registry::SessionRegistry;
use crate::store::{load_consultation, StoreCommand};
use crate::transition::{guard, Action};

/// The original caps the question text at creation time.
const MAX_QUESTION_CHARS: usize = 1000;

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Commands processed sequentially by a consultation actor.
enum ConsultationCommand {
    SetStatus {
        caller: ConnectionHandle,
        status: ConsultationStatus,
        rejection_reason: Option<String>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Join {
        caller: ConnectionHandle,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Message {
        caller: ConnectionHandle,
        content: String,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Read {
        caller: ConnectionHandle,
        message_ids: Vec<String>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    End {
        caller: ConnectionHandle,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Cancel {
        caller_id: String,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Feedback {
        caller_id: String,
        feedback: String,
        rating: Option<u8>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
}

/// Handle to a running consultation actor (cheap to clone).
#[derive(Clone)]
pub struct ConsultationHandle {
    pub id: String,
    command_tx: mpsc::Sender<ConsultationCommand>,
    snapshot: Arc<ArcSwap<Consultation>>,
}

impl ConsultationHandle {
    /// Lock-free snapshot of the record.
    pub fn snapshot(&self) -> Arc<Consultation> {
        self.snapshot.load_full()
    }

    async fn send(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), ProtocolError>>) -> ConsultationCommand,
    ) -> Result<(), ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.command_tx.send(build(reply_tx)).await.is_err() {
            warn!(
                component = "engine",
                event = "engine.actor.channel_closed",
                consultation_id = %self.id,
                "Actor channel closed, command dropped"
            );
            return Err(ProtocolError::NotFound(self.id.clone()));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err(ProtocolError::NotFound(self.id.clone())))
    }
}

/// Shared engine: actor index plus the collaborators actors need.
///
/// The index only holds live consultations: an actor retires itself
/// once its record reaches a terminal status, and later events revive
/// it from the store on demand.
pub struct ProtocolEngine {
    actors: Arc<DashMap<String, ConsultationHandle>>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    store_tx: mpsc::Sender<StoreCommand>,
    db_path: PathBuf,
}

impl ProtocolEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<NotificationDispatcher>,
        store_tx: mpsc::Sender<StoreCommand>,
        db_path: PathBuf,
    ) -> Self {
        Self {
            actors: Arc::new(DashMap::new()),
            registry,
            dispatcher,
            store_tx,
            db_path,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Student opens a new consultation. Creates the record atomically
    /// in `pending`, spawns its actor, persists, and pushes
    /// `consultation:new` to the teacher's personal channel. Returns
    /// the created record so the gateway can ack the student.
    pub async fn request(
        &self,
        caller: &ConnectionHandle,
        teacher_id: String,
        subject: String,
        question: String,
    ) -> Result<Consultation, ProtocolError> {
        if caller.role != Role::Student {
            return Err(ProtocolError::NotAuthorized(
                "only students may request consultations".into(),
            ));
        }
        if question.chars().count() > MAX_QUESTION_CHARS {
            return Err(ProtocolError::InvalidState(format!(
                "question exceeds {MAX_QUESTION_CHARS} characters"
            )));
        }

        let now = now_millis();
        let consultation = Consultation {
            id: new_id(),
            student_id: caller.user_id.clone(),
            teacher_id: teacher_id.clone(),
            subject,
            question,
            status: ConsultationStatus::Pending,
            scheduled_time: None,
            messages: Vec::new(),
            rejection_reason: None,
            feedback: None,
            rating: None,
            created_at: now,
            updated_at: now,
        };

        if self
            .store_tx
            .send(StoreCommand::Create {
                consultation: consultation.clone(),
            })
            .await
            .is_err()
        {
            warn!(
                component = "engine",
                event = "engine.store.channel_closed",
                consultation_id = %consultation.id,
                "Store writer unavailable, write dropped"
            );
        }

        self.spawn_actor(consultation.clone());

        info!(
            component = "engine",
            event = "consultation.requested",
            consultation_id = %consultation.id,
            student_id = %consultation.student_id,
            teacher_id = %teacher_id,
            subject = %consultation.subject,
            "Consultation requested"
        );

        self.dispatcher.notify_user(
            &teacher_id,
            ServerEvent::New {
                consultation: consultation.without_messages(),
            },
        );

        Ok(consultation)
    }

    pub async fn set_status(
        &self,
        caller: ConnectionHandle,
        consultation_id: &str,
        status: ConsultationStatus,
        rejection_reason: Option<String>,
    ) -> Result<(), ProtocolError> {
        let actor = self.actor(consultation_id).await?;
        actor
            .send(|reply| ConsultationCommand::SetStatus {
                caller,
                status,
                rejection_reason,
                reply,
            })
            .await
    }

    pub async fn join(
        &self,
        caller: ConnectionHandle,
        consultation_id: &str,
    ) -> Result<(), ProtocolError> {
        let actor = self.actor(consultation_id).await?;
        actor
            .send(|reply| ConsultationCommand::Join { caller, reply })
            .await
    }

    pub async fn message(
        &self,
        caller: ConnectionHandle,
        consultation_id: &str,
        content: String,
    ) -> Result<(), ProtocolError> {
        let actor = self.actor(consultation_id).await?;
        actor
            .send(|reply| ConsultationCommand::Message {
                caller,
                content,
                reply,
            })
            .await
    }

    pub async fn read(
        &self,
        caller: ConnectionHandle,
        consultation_id: &str,
        message_ids: Vec<String>,
    ) -> Result<(), ProtocolError> {
        let actor = self.actor(consultation_id).await?;
        actor
            .send(|reply| ConsultationCommand::Read {
                caller,
                message_ids,
                reply,
            })
            .await
    }

    pub async fn end(
        &self,
        caller: ConnectionHandle,
        consultation_id: &str,
    ) -> Result<(), ProtocolError> {
        let actor = self.actor(consultation_id).await?;
        actor
            .send(|reply| ConsultationCommand::End { caller, reply })
            .await
    }

    /// Student-initiated synchronous cancel (REST path, pending only).
    pub async fn cancel(&self, caller_id: &str, consultation_id: &str) -> Result<(), ProtocolError> {
        let actor = self.actor(consultation_id).await?;
        let caller_id = caller_id.to_string();
        actor
            .send(|reply| ConsultationCommand::Cancel { caller_id, reply })
            .await
    }

    /// Attach feedback after completion (REST path).
    pub async fn feedback(
        &self,
        caller_id: &str,
        consultation_id: &str,
        feedback: String,
        rating: Option<u8>,
    ) -> Result<(), ProtocolError> {
        let actor = self.actor(consultation_id).await?;
        let caller_id = caller_id.to_string();
        actor
            .send(|reply| ConsultationCommand::Feedback {
                caller_id,
                feedback,
                rating,
                reply,
            })
            .await
    }

    /// Participant-only record snapshot (REST detail view).
    pub async fn detail(
        &self,
        caller_id: &str,
        consultation_id: &str,
    ) -> Result<Consultation, ProtocolError> {
        let actor = self.actor(consultation_id).await?;
        let snapshot = actor.snapshot();
        if !snapshot.is_participant(caller_id) {
            return Err(ProtocolError::NotAuthorized(
                "not a participant of this consultation".into(),
            ));
        }
        Ok((*snapshot).clone())
    }

    /// Find the actor for a consultation, reviving it from the durable
    /// store after a restart. Room membership is not revived.
    async fn actor(&self, consultation_id: &str) -> Result<ConsultationHandle, ProtocolError> {
        if let Some(handle) = self.actors.get(consultation_id) {
            return Ok(handle.clone());
        }

        let db_path = self.db_path.clone();
        let id = consultation_id.to_string();
        let loaded = tokio::task::spawn_blocking(move || load_consultation(&db_path, &id))
            .await
            .map_err(|e| ProtocolError::Transport(format!("store load task failed: {e}")))?
            .map_err(|e| ProtocolError::Transport(format!("store load failed: {e}")))?;

        let Some(record) = loaded else {
            return Err(ProtocolError::NotFound(consultation_id.to_string()));
        };

        info!(
            component = "engine",
            event = "consultation.revived",
            consultation_id = %consultation_id,
            status = ?record.status,
            messages = record.messages.len(),
            "Consultation revived from store"
        );

        Ok(self.spawn_actor(record))
    }

    fn spawn_actor(&self, record: Consultation) -> ConsultationHandle {
        // A concurrent revive may have won the race; reuse its actor.
        let entry = self.actors.entry(record.id.clone());
        let handle = entry.or_insert_with(|| {
            let (command_tx, command_rx) = mpsc::channel(256);
            let snapshot = Arc::new(ArcSwap::from_pointee(record.clone()));
            let handle = ConsultationHandle {
                id: record.id.clone(),
                command_tx,
                snapshot: snapshot.clone(),
            };

            let actor = ConsultationActor {
                record,
                snapshot,
                actors: self.actors.clone(),
                registry: self.registry.clone(),
                dispatcher: self.dispatcher.clone(),
                store_tx: self.store_tx.clone(),
            };
            tokio::spawn(actor.run(command_rx));

            handle
        });
        handle.clone()
    }
}

/// Owns one consultation record; the single writer for it.
struct ConsultationActor {
    record: Consultation,
    snapshot: Arc<ArcSwap<Consultation>>,
    actors: Arc<DashMap<String, ConsultationHandle>>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    store_tx: mpsc::Sender<StoreCommand>,
}

impl ConsultationActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<ConsultationCommand>) {
        // A record revived in a terminal status retires right away; the
        // actor keeps serving callers that already hold its handle and
        // exits when the last one drops.
        if self.record.status.is_terminal() {
            self.retire().await;
        }
        while let Some(cmd) = command_rx.recv().await {
            match cmd {
                ConsultationCommand::SetStatus {
                    caller,
                    status,
                    rejection_reason,
                    reply,
                } => {
                    let result = self.handle_set_status(&caller, status, rejection_reason).await;
                    let _ = reply.send(result);
                }
                ConsultationCommand::Join { caller, reply } => {
                    let result = self.handle_join(caller);
                    let _ = reply.send(result);
                }
                ConsultationCommand::Message {
                    caller,
                    content,
                    reply,
                } => {
                    let result = self.handle_message(&caller, content).await;
                    let _ = reply.send(result);
                }
                ConsultationCommand::Read {
                    caller,
                    message_ids,
                    reply,
                } => {
                    let result = self.handle_read(&caller, message_ids).await;
                    let _ = reply.send(result);
                }
                ConsultationCommand::End { caller, reply } => {
                    let result = self.handle_end(&caller).await;
                    let _ = reply.send(result);
                }
                ConsultationCommand::Cancel { caller_id, reply } => {
                    let result = self.handle_cancel(&caller_id).await;
                    let _ = reply.send(result);
                }
                ConsultationCommand::Feedback {
                    caller_id,
                    feedback,
                    rating,
                    reply,
                } => {
                    let result = self.handle_feedback(&caller_id, feedback, rating).await;
                    let _ = reply.send(result);
                }
            }
            if self.record.status.is_terminal() {
                self.retire().await;
            }
        }
    }

    /// Drop this consultation from the live index once it is terminal.
    /// Queued writes are flushed first, so a later revival from the
    /// store cannot observe a pre-terminal record.
    async fn retire(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .store_tx
            .send(StoreCommand::Flush { ack: ack_tx })
            .await
            .is_err()
            || ack_rx.await.is_err()
        {
            warn!(
                component = "engine",
                event = "engine.store.flush_unacked",
                consultation_id = %self.record.id,
                "Store writer unavailable, retiring without flush"
            );
        }

        if self.actors.remove(&self.record.id).is_some() {
            info!(
                component = "engine",
                event = "consultation.retired",
                consultation_id = %self.record.id,
                status = ?self.record.status,
                "Consultation retired from live index"
            );
        }
    }

    /// Hand a durable write to the store writer. Failure means the
    /// writer task is gone; the in-memory record stays authoritative.
    async fn persist(&self, command: StoreCommand) {
        if self.store_tx.send(command).await.is_err() {
            warn!(
                component = "engine",
                event = "engine.store.channel_closed",
                consultation_id = %self.record.id,
                "Store writer unavailable, write dropped"
            );
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.store(Arc::new(self.record.clone()));
    }

    /// Broadcast to every connection in the room, skipping connections
    /// owned by `exclude_user` when set. Per-connection failures are
    /// logged and ignored.
    fn broadcast_room(&self, event: ServerEvent, exclude_user: Option<&str>) {
        for conn in self.registry.connections_in_room(&self.record.id) {
            if exclude_user.is_some_and(|user| conn.user_id == user) {
                continue;
            }
            if let Err(e) = conn.deliver(event.clone()) {
                warn!(
                    component = "engine",
                    event = "engine.broadcast.failed",
                    consultation_id = %self.record.id,
                    connection_id = conn.conn_id,
                    error = %e,
                    "Room broadcast failed for one connection"
                );
            }
        }
    }

    async fn persist_status(&self, rejection_reason: Option<String>) {
        self.persist(StoreCommand::SetStatus {
            id: self.record.id.clone(),
            status: self.record.status,
            rejection_reason,
            updated_at: self.record.updated_at,
        })
        .await;
    }

    async fn handle_set_status(
        &mut self,
        caller: &ConnectionHandle,
        status: ConsultationStatus,
        rejection_reason: Option<String>,
    ) -> Result<(), ProtocolError> {
        let action = match status {
            ConsultationStatus::Accepted => Action::Accept,
            ConsultationStatus::Rejected => Action::Reject,
            other => {
                return Err(ProtocolError::InvalidState(format!(
                    "status event may only set accepted or rejected, not {other:?}"
                )))
            }
        };
        guard(&self.record, &caller.user_id, action)?;

        self.record.status = status;
        self.record.updated_at = now_millis();
        if status == ConsultationStatus::Rejected {
            self.record.rejection_reason = rejection_reason.clone();
        }
        self.publish_snapshot();
        self.persist_status(rejection_reason).await;

        info!(
            component = "engine",
            event = "consultation.status_changed",
            consultation_id = %self.record.id,
            status = ?status,
            "Consultation status changed"
        );

        let view = self.record.without_messages();
        match status {
            ConsultationStatus::Accepted => {
                // Both sides learn the room is ready to join.
                let ready = ServerEvent::Ready {
                    consultation: view,
                };
                self.dispatcher
                    .notify_user(&self.record.student_id, ready.clone());
                self.dispatcher.notify_user(&self.record.teacher_id, ready);
            }
            ConsultationStatus::Rejected => {
                self.dispatcher.notify_user(
                    &self.record.student_id,
                    ServerEvent::Status { consultation: view },
                );
            }
            _ => {}
        }

        Ok(())
    }

    fn handle_join(&mut self, caller: ConnectionHandle) -> Result<(), ProtocolError> {
        guard(&self.record, &caller.user_id, Action::Join)?;

        // Replay to the joining connection only; other room members
        // already have the log. Membership is granted only once the
        // replay landed, so a dead connection never enters the room.
        caller.deliver(ServerEvent::History {
            messages: self.record.messages.clone(),
        })?;
        self.registry.join_room(&self.record.id, caller);
        Ok(())
    }

    async fn handle_message(
        &mut self,
        caller: &ConnectionHandle,
        content: String,
    ) -> Result<(), ProtocolError> {
        guard(&self.record, &caller.user_id, Action::Message)?;
        self.require_joined(caller)?;

        // Server-assigned timestamp, strictly monotonic within the
        // consultation regardless of arrival interleaving.
        let last = self.record.messages.last().map(|m| m.timestamp).unwrap_or(0);
        let timestamp = now_millis().max(last + 1);

        let message = ChatMessage {
            id: new_id(),
            sender_id: caller.user_id.clone(),
            content,
            timestamp,
            read: false,
        };

        self.record.messages.push(message.clone());
        self.record.updated_at = timestamp;
        self.publish_snapshot();

        // Persistence first; broadcast is best-effort and never rolls
        // the append back.
        self.persist(StoreCommand::AppendMessage {
            consultation_id: self.record.id.clone(),
            message: message.clone(),
        })
        .await;

        self.broadcast_room(ServerEvent::Message { message }, None);
        Ok(())
    }

    async fn handle_read(
        &mut self,
        caller: &ConnectionHandle,
        message_ids: Vec<String>,
    ) -> Result<(), ProtocolError> {
        guard(&self.record, &caller.user_id, Action::Read)?;
        self.require_joined(caller)?;

        // Only messages sent by the other party, not yet read.
        let mut flipped = Vec::new();
        for message in &mut self.record.messages {
            if message.read || message.sender_id == caller.user_id {
                continue;
            }
            if message_ids.iter().any(|id| id == &message.id) {
                message.read = true;
                flipped.push(message.id.clone());
            }
        }

        // Re-submitting already-read ids is an idempotent no-op.
        if flipped.is_empty() {
            return Ok(());
        }

        self.record.updated_at = now_millis();
        self.publish_snapshot();

        self.persist(StoreCommand::MarkRead {
            consultation_id: self.record.id.clone(),
            message_ids: flipped.clone(),
        })
        .await;

        // The caller's own devices already know; exclude them.
        self.broadcast_room(
            ServerEvent::Read {
                message_ids: flipped,
            },
            Some(&caller.user_id),
        );
        Ok(())
    }

    async fn handle_end(&mut self, caller: &ConnectionHandle) -> Result<(), ProtocolError> {
        guard(&self.record, &caller.user_id, Action::End)?;

        self.record.status = ConsultationStatus::Completed;
        self.record.updated_at = now_millis();
        self.publish_snapshot();
        self.persist_status(None).await;

        info!(
            component = "engine",
            event = "consultation.ended",
            consultation_id = %self.record.id,
            "Consultation ended by teacher"
        );

        self.broadcast_room(
            ServerEvent::Ended {
                consultation: self.record.without_messages(),
            },
            None,
        );
        self.registry.remove_room(&self.record.id);
        Ok(())
    }

    async fn handle_cancel(&mut self, caller_id: &str) -> Result<(), ProtocolError> {
        guard(&self.record, caller_id, Action::Cancel)?;

        self.record.status = ConsultationStatus::Canceled;
        self.record.updated_at = now_millis();
        self.publish_snapshot();
        self.persist_status(None).await;

        info!(
            component = "engine",
            event = "consultation.canceled",
            consultation_id = %self.record.id,
            "Consultation canceled by student"
        );
        Ok(())
    }

    async fn handle_feedback(
        &mut self,
        caller_id: &str,
        feedback: String,
        rating: Option<u8>,
    ) -> Result<(), ProtocolError> {
        guard(&self.record, caller_id, Action::Feedback)?;
        if let Some(rating) = rating {
            if !(1..=5).contains(&rating) {
                return Err(ProtocolError::InvalidState(
                    "rating must be between 1 and 5".into(),
                ));
            }
        }

        self.record.feedback = Some(feedback.clone());
        self.record.rating = rating;
        self.record.updated_at = now_millis();
        self.publish_snapshot();

        self.persist(StoreCommand::SetFeedback {
            id: self.record.id.clone(),
            feedback,
            rating,
            updated_at: self.record.updated_at,
        })
        .await;
        Ok(())
    }

    /// `message`/`read` require the sender's connection to have joined
    /// the room. Joins for a given connection are serialized on this
    /// same actor, so membership cannot be stale for the caller.
    fn require_joined(&self, caller: &ConnectionHandle) -> Result<(), ProtocolError> {
        if self.registry.is_in_room(&self.record.id, caller.conn_id) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidState(
                "join the consultation before sending".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OutboundFrame;
    use crate::store::{create_store_channel, init_schema, StoreWriter};
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    struct TestBed {
        engine: Arc<ProtocolEngine>,
        _dir: tempfile::TempDir,
        db_path: PathBuf,
        next_conn_id: u64,
    }

    impl TestBed {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let db_path = dir.path().join("test.db");
            init_schema(&db_path).expect("schema");

            let (store_tx, store_rx) = create_store_channel();
            tokio::spawn(StoreWriter::new(store_rx, db_path.clone()).run());

            let registry = Arc::new(SessionRegistry::new());
            let dispatcher = Arc::new(NotificationDispatcher::new());
            let engine = Arc::new(ProtocolEngine::new(
                registry,
                dispatcher,
                store_tx,
                db_path.clone(),
            ));

            Self {
                engine,
                _dir: dir,
                db_path,
                next_conn_id: 0,
            }
        }

        /// Register a connection on its personal channel and return the
        /// handle plus the frames its writer task would see.
        fn connect(&mut self, user_id: &str, role: Role) -> (ConnectionHandle, Receiver<OutboundFrame>) {
            self.next_conn_id += 1;
            let (tx, rx) = mpsc::channel(64);
            let conn = ConnectionHandle::new(self.next_conn_id, user_id.to_string(), role, tx);
            self.engine.dispatcher().register(conn.clone());
            (conn, rx)
        }
    }

    fn expect_event(rx: &mut Receiver<OutboundFrame>) -> ServerEvent {
        match rx.try_recv() {
            Ok(OutboundFrame::Event(event)) => event,
            other => panic!("expected event frame, got {:?}", other),
        }
    }

    async fn accepted_consultation(
        bed: &mut TestBed,
    ) -> (
        String,
        ConnectionHandle,
        Receiver<OutboundFrame>,
        ConnectionHandle,
        Receiver<OutboundFrame>,
    ) {
        let (student, mut student_rx) = bed.connect("s1", Role::Student);
        let (teacher, mut teacher_rx) = bed.connect("t1", Role::Teacher);

        let consultation = bed
            .engine
            .request(&student, "t1".into(), "math".into(), "need help".into())
            .await
            .expect("request");
        let id = consultation.id.clone();

        // Drain the teacher's `consultation:new` notification.
        assert!(matches!(expect_event(&mut teacher_rx), ServerEvent::New { .. }));

        bed.engine
            .set_status(teacher.clone(), &id, ConsultationStatus::Accepted, None)
            .await
            .expect("accept");

        // Both personal channels got `consultation:ready`.
        assert!(matches!(expect_event(&mut student_rx), ServerEvent::Ready { .. }));
        assert!(matches!(expect_event(&mut teacher_rx), ServerEvent::Ready { .. }));

        bed.engine.join(student.clone(), &id).await.expect("student join");
        bed.engine.join(teacher.clone(), &id).await.expect("teacher join");
        assert!(matches!(
            expect_event(&mut student_rx),
            ServerEvent::History { messages } if messages.is_empty()
        ));
        assert!(matches!(expect_event(&mut teacher_rx), ServerEvent::History { .. }));

        (id, student, student_rx, teacher, teacher_rx)
    }

    #[tokio::test]
    async fn request_notifies_teacher_personal_channel() {
        // Scenario A
        let mut bed = TestBed::new();
        let (student, _student_rx) = bed.connect("s1", Role::Student);
        let (_teacher, mut teacher_rx) = bed.connect("t1", Role::Teacher);

        let consultation = bed
            .engine
            .request(&student, "t1".into(), "math".into(), "limits".into())
            .await
            .expect("request");
        assert_eq!(consultation.status, ConsultationStatus::Pending);

        match expect_event(&mut teacher_rx) {
            ServerEvent::New { consultation: c } => {
                assert_eq!(c.id, consultation.id);
                assert_eq!(c.subject, "math");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn teacher_only_requests_rejected() {
        let mut bed = TestBed::new();
        let (teacher, _rx) = bed.connect("t1", Role::Teacher);
        let err = bed
            .engine
            .request(&teacher, "t2".into(), "math".into(), "q".into())
            .await
            .expect_err("teacher request");
        assert_eq!(err.code(), "not_authorized");
    }

    #[tokio::test]
    async fn accept_readies_both_sides_and_join_replays_empty_history() {
        // Scenario B — covered by the shared setup.
        let mut bed = TestBed::new();
        let _ = accepted_consultation(&mut bed).await;
    }

    #[tokio::test]
    async fn reject_notifies_student_with_reason() {
        let mut bed = TestBed::new();
        let (student, mut student_rx) = bed.connect("s1", Role::Student);
        let (teacher, mut teacher_rx) = bed.connect("t1", Role::Teacher);

        let consultation = bed
            .engine
            .request(&student, "t1".into(), "math".into(), "q".into())
            .await
            .expect("request");
        let _ = expect_event(&mut teacher_rx);

        bed.engine
            .set_status(
                teacher,
                &consultation.id,
                ConsultationStatus::Rejected,
                Some("fully booked".into()),
            )
            .await
            .expect("reject");

        match expect_event(&mut student_rx) {
            ServerEvent::Status { consultation: c } => {
                assert_eq!(c.status, ConsultationStatus::Rejected);
                assert_eq!(c.rejection_reason.as_deref(), Some("fully booked"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn message_broadcasts_to_all_teacher_devices_with_same_identity() {
        // Scenario C
        let mut bed = TestBed::new();
        let (id, student, mut student_rx, _teacher, mut teacher_rx) =
            accepted_consultation(&mut bed).await;

        // Second teacher device joins the room too.
        let (teacher2, mut teacher2_rx) = bed.connect("t1", Role::Teacher);
        bed.engine.join(teacher2, &id).await.expect("join device 2");
        let _ = expect_event(&mut teacher2_rx); // history

        bed.engine
            .message(student, &id, "need help".into())
            .await
            .expect("message");

        let events = [
            expect_event(&mut student_rx),
            expect_event(&mut teacher_rx),
            expect_event(&mut teacher2_rx),
        ];
        let mut seen = Vec::new();
        for event in events {
            match event {
                ServerEvent::Message { message } => {
                    assert_eq!(message.content, "need help");
                    assert_eq!(message.sender_id, "s1");
                    seen.push((message.id, message.timestamp));
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(seen[0], seen[1]);
        assert_eq!(seen[1], seen[2]);
    }

    #[tokio::test]
    async fn outsider_message_fails_with_no_state_change() {
        let mut bed = TestBed::new();
        let (id, _student, _student_rx, _teacher, _teacher_rx) =
            accepted_consultation(&mut bed).await;

        let (outsider, _rx) = bed.connect("intruder", Role::Student);
        let err = bed
            .engine
            .message(outsider.clone(), &id, "let me in".into())
            .await
            .expect_err("outsider");
        assert_eq!(err.code(), "not_authorized");

        let err = bed
            .engine
            .read(outsider, &id, vec!["m1".into()])
            .await
            .expect_err("outsider read");
        assert_eq!(err.code(), "not_authorized");

        let snapshot = bed.engine.detail("s1", &id).await.expect("detail");
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn join_before_accept_is_invalid_state() {
        let mut bed = TestBed::new();
        let (student, _student_rx) = bed.connect("s1", Role::Student);
        let (_teacher, mut teacher_rx) = bed.connect("t1", Role::Teacher);

        let consultation = bed
            .engine
            .request(&student, "t1".into(), "math".into(), "q".into())
            .await
            .expect("request");
        let _ = expect_event(&mut teacher_rx);

        let err = bed
            .engine
            .join(student, &consultation.id)
            .await
            .expect_err("join pending");
        assert_eq!(err.code(), "invalid_state");
    }

    #[tokio::test]
    async fn message_requires_prior_join() {
        let mut bed = TestBed::new();
        let (id, _student, _student_rx, teacher, _teacher_rx) =
            accepted_consultation(&mut bed).await;

        // A fresh device of a participant that never joined the room.
        let (teacher2, _rx) = bed.connect("t1", Role::Teacher);
        let err = bed
            .engine
            .message(teacher2, &id, "hi".into())
            .await
            .expect_err("unjoined device");
        assert_eq!(err.code(), "invalid_state");
        let _ = teacher;
    }

    #[tokio::test]
    async fn read_receipt_flips_flags_and_excludes_caller_connections() {
        // Scenario D
        let mut bed = TestBed::new();
        let (id, student, mut student_rx, teacher, mut teacher_rx) =
            accepted_consultation(&mut bed).await;

        bed.engine
            .message(student, &id, "question one".into())
            .await
            .expect("message");
        let msg_id = match expect_event(&mut student_rx) {
            ServerEvent::Message { message } => message.id,
            other => panic!("unexpected event: {:?}", other),
        };
        let _ = expect_event(&mut teacher_rx); // teacher's copy

        bed.engine
            .read(teacher, &id, vec![msg_id.clone()])
            .await
            .expect("read");

        // Student (the sender) is told; the teacher's own connections
        // are excluded from the broadcast.
        match expect_event(&mut student_rx) {
            ServerEvent::Read { message_ids } => assert_eq!(message_ids, vec![msg_id.clone()]),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(teacher_rx.try_recv().is_err());

        let snapshot = bed.engine.detail("s1", &id).await.expect("detail");
        assert!(snapshot.messages[0].read);
    }

    #[tokio::test]
    async fn read_receipt_is_idempotent_and_ignores_own_messages() {
        let mut bed = TestBed::new();
        let (id, student, mut student_rx, teacher, mut teacher_rx) =
            accepted_consultation(&mut bed).await;

        bed.engine
            .message(student.clone(), &id, "hello".into())
            .await
            .expect("message");
        let msg_id = match expect_event(&mut student_rx) {
            ServerEvent::Message { message } => message.id,
            other => panic!("unexpected event: {:?}", other),
        };
        let _ = expect_event(&mut teacher_rx);

        // The sender cannot mark their own message read.
        bed.engine
            .read(student.clone(), &id, vec![msg_id.clone()])
            .await
            .expect("own-message read is a no-op");
        assert!(teacher_rx.try_recv().is_err());
        let snapshot = bed.engine.detail("s1", &id).await.expect("detail");
        assert!(!snapshot.messages[0].read);

        // First receipt flips; a duplicate produces no second broadcast.
        bed.engine
            .read(teacher.clone(), &id, vec![msg_id.clone()])
            .await
            .expect("read");
        let _ = expect_event(&mut student_rx);
        bed.engine
            .read(teacher, &id, vec![msg_id])
            .await
            .expect("duplicate read");
        assert!(student_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn end_tears_down_room_and_blocks_further_messages() {
        // Scenario E
        let mut bed = TestBed::new();
        let (id, student, mut student_rx, teacher, mut teacher_rx) =
            accepted_consultation(&mut bed).await;

        bed.engine.end(teacher.clone(), &id).await.expect("end");

        assert!(matches!(expect_event(&mut student_rx), ServerEvent::Ended { .. }));
        assert!(matches!(expect_event(&mut teacher_rx), ServerEvent::Ended { .. }));

        for (conn, label) in [(student, "student"), (teacher, "teacher")] {
            let err = bed
                .engine
                .message(conn, &id, "one more".into())
                .await
                .expect_err(label);
            assert_eq!(err.code(), "invalid_state");
        }
    }

    #[tokio::test]
    async fn timestamps_strictly_increase_under_interleaved_senders() {
        let mut bed = TestBed::new();
        let (id, student, mut student_rx, teacher, _teacher_rx) =
            accepted_consultation(&mut bed).await;

        let mut tasks = Vec::new();
        for i in 0..10 {
            let engine = bed.engine.clone();
            let conn = if i % 2 == 0 { student.clone() } else { teacher.clone() };
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                engine.message(conn, &id, format!("msg {i}")).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("message");
        }

        let snapshot = bed.engine.detail("s1", &id).await.expect("detail");
        assert_eq!(snapshot.messages.len(), 10);
        for pair in snapshot.messages.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
        let _ = student_rx.try_recv();
    }

    #[tokio::test]
    async fn cancel_is_pending_only_and_synchronous() {
        let mut bed = TestBed::new();
        let (student, _student_rx) = bed.connect("s1", Role::Student);
        let (teacher, mut teacher_rx) = bed.connect("t1", Role::Teacher);

        let consultation = bed
            .engine
            .request(&student, "t1".into(), "math".into(), "q".into())
            .await
            .expect("request");
        let _ = expect_event(&mut teacher_rx);

        bed.engine.cancel("s1", &consultation.id).await.expect("cancel");
        let snapshot = bed.engine.detail("s1", &consultation.id).await.expect("detail");
        assert_eq!(snapshot.status, ConsultationStatus::Canceled);

        // Terminal: the teacher can no longer accept.
        let err = bed
            .engine
            .set_status(teacher, &consultation.id, ConsultationStatus::Accepted, None)
            .await
            .expect_err("accept canceled");
        assert_eq!(err.code(), "invalid_state");
    }

    #[tokio::test]
    async fn feedback_requires_completion_and_valid_rating() {
        let mut bed = TestBed::new();
        let (id, _student, _student_rx, teacher, _teacher_rx) =
            accepted_consultation(&mut bed).await;

        let err = bed
            .engine
            .feedback("s1", &id, "great".into(), Some(5))
            .await
            .expect_err("feedback before end");
        assert_eq!(err.code(), "invalid_state");

        bed.engine.end(teacher, &id).await.expect("end");

        let err = bed
            .engine
            .feedback("s1", &id, "great".into(), Some(9))
            .await
            .expect_err("rating out of range");
        assert_eq!(err.code(), "invalid_state");

        bed.engine
            .feedback("s1", &id, "great".into(), Some(5))
            .await
            .expect("feedback");
        let snapshot = bed.engine.detail("s1", &id).await.expect("detail");
        assert_eq!(snapshot.feedback.as_deref(), Some("great"));
        assert_eq!(snapshot.rating, Some(5));
    }

    #[tokio::test]
    async fn unknown_consultation_is_not_found() {
        let mut bed = TestBed::new();
        let (student, _rx) = bed.connect("s1", Role::Student);
        let err = bed
            .engine
            .message(student, "no-such-id", "hi".into())
            .await
            .expect_err("unknown id");
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn consultation_revives_from_store_after_actor_index_loss() {
        let mut bed = TestBed::new();
        let (student, _student_rx) = bed.connect("s1", Role::Student);
        let (_teacher, mut teacher_rx) = bed.connect("t1", Role::Teacher);

        let consultation = bed
            .engine
            .request(&student, "t1".into(), "math".into(), "q".into())
            .await
            .expect("request");
        let _ = expect_event(&mut teacher_rx);

        // Give the write-behind store a moment to flush.
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Fresh engine over the same database — simulates a restart.
        let (store_tx, store_rx) = create_store_channel();
        tokio::spawn(StoreWriter::new(store_rx, bed.db_path.clone()).run());
        let engine = ProtocolEngine::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(NotificationDispatcher::new()),
            store_tx,
            bed.db_path.clone(),
        );

        let detail = engine.detail("s1", &consultation.id).await.expect("revived");
        assert_eq!(detail.status, ConsultationStatus::Pending);
    }

    #[tokio::test]
    async fn failed_history_delivery_does_not_register_the_connection() {
        let mut bed = TestBed::new();
        let (id, _student, _student_rx, _teacher, _teacher_rx) =
            accepted_consultation(&mut bed).await;

        // Participant device whose outbound buffer is already full, so
        // the history replay cannot be delivered.
        let (tx, _stuck_rx) = mpsc::channel(1);
        tx.try_send(OutboundFrame::Pong(Vec::new())).expect("fill buffer");
        let stuck = ConnectionHandle::new(99, "s1".into(), Role::Student, tx);

        let err = bed
            .engine
            .join(stuck, &id)
            .await
            .expect_err("join with full buffer");
        assert_eq!(err.code(), "transport_error");
        assert!(!bed.engine.registry().is_in_room(&id, 99));
    }

    #[tokio::test]
    async fn ended_consultation_retires_from_live_index() {
        let mut bed = TestBed::new();
        let (id, _student, _student_rx, teacher, _teacher_rx) =
            accepted_consultation(&mut bed).await;

        bed.engine.end(teacher, &id).await.expect("end");

        // Retirement runs on the actor task right after the reply.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bed.engine.actors.get(&id).is_none());

        // Still reachable: the record revives from the store on demand,
        // already in its terminal status.
        let detail = bed.engine.detail("s1", &id).await.expect("detail");
        assert_eq!(detail.status, ConsultationStatus::Completed);
    }

    #[tokio::test]
    async fn store_writer_loss_does_not_fail_live_mutations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("test.db");
        init_schema(&db_path).expect("schema");

        // Writer side gone: every durable hand-off fails and is logged.
        let (store_tx, store_rx) = create_store_channel();
        drop(store_rx);

        let engine = Arc::new(ProtocolEngine::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(NotificationDispatcher::new()),
            store_tx,
            db_path,
        ));

        let (student_tx, _student_rx) = mpsc::channel(64);
        let student = ConnectionHandle::new(1, "s1".into(), Role::Student, student_tx);
        let (teacher_tx, _teacher_rx) = mpsc::channel(64);
        let teacher = ConnectionHandle::new(2, "t1".into(), Role::Teacher, teacher_tx);
        engine.dispatcher().register(student.clone());
        engine.dispatcher().register(teacher.clone());

        let consultation = engine
            .request(&student, "t1".into(), "math".into(), "q".into())
            .await
            .expect("request");
        engine
            .set_status(
                teacher.clone(),
                &consultation.id,
                ConsultationStatus::Accepted,
                None,
            )
            .await
            .expect("accept");
        engine.join(student.clone(), &consultation.id).await.expect("join");
        engine
            .message(student, &consultation.id, "hi".into())
            .await
            .expect("message");
    }
}
