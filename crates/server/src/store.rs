//! Session store — batched SQLite writes.
//!
//! The engine actor holds the authoritative in-memory record and sends
//! durable mutations through this channel. Writes are batched and
//! executed on a blocking thread (`spawn_blocking`); loads are
//! synchronous and used to revive an actor after restart. Room
//! membership is deliberately not persisted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use tutorlink_protocol::{ChatMessage, Consultation, ConsultationStatus};

/// Durable mutations, each atomic at the single-record level.
#[derive(Debug)]
pub enum StoreCommand {
    /// Create a new consultation (status pending, no messages yet).
    Create { consultation: Consultation },

    /// Status transition, with the rejection reason when rejecting.
    SetStatus {
        id: String,
        status: ConsultationStatus,
        rejection_reason: Option<String>,
        updated_at: i64,
    },

    /// Append one chat message.
    AppendMessage {
        consultation_id: String,
        message: ChatMessage,
    },

    /// Flip the read flag for a set of message ids.
    MarkRead {
        consultation_id: String,
        message_ids: Vec<String>,
    },

    /// Attach feedback and rating after completion.
    SetFeedback {
        id: String,
        feedback: String,
        rating: Option<u8>,
        updated_at: i64,
    },

    /// Flush everything queued ahead of this command, then ack. Lets a
    /// caller make preceding writes durable before acting on them.
    Flush { ack: oneshot::Sender<()> },
}

/// Create the store channel with a reasonable buffer.
pub fn create_store_channel() -> (mpsc::Sender<StoreCommand>, mpsc::Receiver<StoreCommand>) {
    mpsc::channel(512)
}

/// Store writer that batches SQLite writes.
pub struct StoreWriter {
    rx: mpsc::Receiver<StoreCommand>,
    db_path: PathBuf,
    batch: Vec<StoreCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl StoreWriter {
    pub fn new(rx: mpsc::Receiver<StoreCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(100),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run the store writer (call from tokio::spawn). Flushes any
    /// remaining batch when the channel closes.
    pub async fn run(mut self) {
        info!(
            component = "store",
            event = "store.writer.started",
            db_path = %self.db_path.display(),
            "Store writer started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(StoreCommand::Flush { ack }) => {
                            self.flush().await;
                            let _ = ack.send(());
                        }
                        Some(cmd) => {
                            self.batch.push(cmd);
                            if self.batch.len() >= self.batch_size {
                                self.flush().await;
                            }
                        }
                        None => {
                            self.flush().await;
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "store",
                    event = "store.flush.ok",
                    commands = count,
                    "Persisted commands"
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "store",
                    event = "store.flush.failed",
                    error = %e,
                    "Store flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "store",
                    event = "store.flush.panicked",
                    error = %e,
                    "spawn_blocking panicked"
                );
            }
        }
    }
}

/// Create tables if missing. Called once at startup before the writer
/// accepts commands.
pub fn init_schema(db_path: &Path) -> Result<(), rusqlite::Error> {
    if let Some(parent) = db_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = open(db_path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS consultations (
            id               TEXT PRIMARY KEY,
            student_id       TEXT NOT NULL,
            teacher_id       TEXT NOT NULL,
            subject          TEXT NOT NULL,
            question         TEXT NOT NULL,
            status           TEXT NOT NULL,
            scheduled_time   TEXT,
            rejection_reason TEXT,
            feedback         TEXT,
            rating           INTEGER,
            created_at       INTEGER NOT NULL,
            updated_at       INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            consultation_id TEXT NOT NULL,
            sender_id       TEXT NOT NULL,
            content         TEXT NOT NULL,
            timestamp       INTEGER NOT NULL,
            read_flag       INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_messages_consultation
            ON messages(consultation_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_consultations_student
            ON consultations(student_id, status);
        CREATE INDEX IF NOT EXISTS idx_consultations_teacher
            ON consultations(teacher_id, status);",
    )
}

fn open(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Load a consultation with its ordered message log. Blocking; call
/// from `spawn_blocking`.
pub fn load_consultation(
    db_path: &Path,
    id: &str,
) -> Result<Option<Consultation>, rusqlite::Error> {
    let conn = open(db_path)?;

    let record = conn
        .query_row(
            "SELECT id, student_id, teacher_id, subject, question, status,
                    scheduled_time, rejection_reason, feedback, rating,
                    created_at, updated_at
             FROM consultations WHERE id = ?1",
            params![id],
            |row| {
                Ok(Consultation {
                    id: row.get(0)?,
                    student_id: row.get(1)?,
                    teacher_id: row.get(2)?,
                    subject: row.get(3)?,
                    question: row.get(4)?,
                    status: status_from_str(&row.get::<_, String>(5)?),
                    scheduled_time: row.get(6)?,
                    rejection_reason: row.get(7)?,
                    feedback: row.get(8)?,
                    rating: row.get(9)?,
                    created_at: row.get(10)?,
                    updated_at: row.get(11)?,
                    messages: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut record) = record else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, sender_id, content, timestamp, read_flag
         FROM messages WHERE consultation_id = ?1 ORDER BY timestamp ASC",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok(ChatMessage {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            content: row.get(2)?,
            timestamp: row.get(3)?,
            read: row.get::<_, i64>(4)? != 0,
        })
    })?;
    for msg in rows {
        record.messages.push(msg?);
    }

    Ok(record.into())
}

/// Flush a batch of commands inside one transaction (blocking thread).
fn flush_batch(db_path: &Path, batch: Vec<StoreCommand>) -> Result<usize, rusqlite::Error> {
    let conn = open(db_path)?;
    let count = batch.len();
    let tx = conn.unchecked_transaction()?;

    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!(
                component = "store",
                event = "store.command.failed",
                error = %e,
                "Failed to execute store command"
            );
            // Continue with the rest of the batch
        }
    }

    tx.commit()?;
    Ok(count)
}

fn execute_command(conn: &Connection, cmd: StoreCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        StoreCommand::Create { consultation } => {
            conn.execute(
                "INSERT OR REPLACE INTO consultations
                 (id, student_id, teacher_id, subject, question, status,
                  scheduled_time, rejection_reason, feedback, rating,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    consultation.id,
                    consultation.student_id,
                    consultation.teacher_id,
                    consultation.subject,
                    consultation.question,
                    status_to_str(consultation.status),
                    consultation.scheduled_time,
                    consultation.rejection_reason,
                    consultation.feedback,
                    consultation.rating,
                    consultation.created_at,
                    consultation.updated_at,
                ],
            )?;
        }

        StoreCommand::SetStatus {
            id,
            status,
            rejection_reason,
            updated_at,
        } => {
            conn.execute(
                "UPDATE consultations
                 SET status = ?2,
                     rejection_reason = COALESCE(?3, rejection_reason),
                     updated_at = ?4
                 WHERE id = ?1",
                params![id, status_to_str(status), rejection_reason, updated_at],
            )?;
        }

        StoreCommand::AppendMessage {
            consultation_id,
            message,
        } => {
            conn.execute(
                "INSERT OR IGNORE INTO messages
                 (id, consultation_id, sender_id, content, timestamp, read_flag)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    consultation_id,
                    message.sender_id,
                    message.content,
                    message.timestamp,
                    message.read as i64,
                ],
            )?;
        }

        StoreCommand::MarkRead {
            consultation_id,
            message_ids,
        } => {
            for message_id in message_ids {
                conn.execute(
                    "UPDATE messages SET read_flag = 1
                     WHERE id = ?1 AND consultation_id = ?2",
                    params![message_id, consultation_id],
                )?;
            }
        }

        StoreCommand::SetFeedback {
            id,
            feedback,
            rating,
            updated_at,
        } => {
            conn.execute(
                "UPDATE consultations
                 SET feedback = ?2, rating = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, feedback, rating, updated_at],
            )?;
        }

        // Handled by the writer loop; if one lands in a batch anyway,
        // everything ahead of it has just been written.
        StoreCommand::Flush { ack } => {
            let _ = ack.send(());
        }
    }

    Ok(())
}

fn status_to_str(status: ConsultationStatus) -> &'static str {
    match status {
        ConsultationStatus::Pending => "pending",
        ConsultationStatus::Accepted => "accepted",
        ConsultationStatus::Rejected => "rejected",
        ConsultationStatus::Completed => "completed",
        ConsultationStatus::Canceled => "canceled",
    }
}

fn status_from_str(raw: &str) -> ConsultationStatus {
    match raw {
        "accepted" => ConsultationStatus::Accepted,
        "rejected" => ConsultationStatus::Rejected,
        "completed" => ConsultationStatus::Completed,
        "canceled" => ConsultationStatus::Canceled,
        _ => ConsultationStatus::Pending,
    }
}
