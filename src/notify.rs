use rusqlite::{params, Connection};
use uuid::Uuid;

/// One reminder addressed to one recipient.
pub struct ReminderMessage<'a> {
    pub lesson_id: &'a str,
    pub recipient_id: &'a str,
    pub recipient_role: &'a str,
    pub body: String,
}

/// Seam for the external push collaborator. Each send may fail
/// independently; failures are reported, not retried.
pub trait PushTransport {
    fn send(&self, conn: &Connection, msg: &ReminderMessage) -> Result<(), String>;
}

/// Default transport: an outbox table in the workspace database. A real
/// deployment would drain it into the push provider.
pub struct OutboxTransport;

impl PushTransport for OutboxTransport {
    fn send(&self, conn: &Connection, msg: &ReminderMessage) -> Result<(), String> {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs().to_string())
            .unwrap_or_else(|_| "0".to_string());
        conn.execute(
            "INSERT INTO reminder_outbox(id, lesson_id, recipient_id, recipient_role, message, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                msg.lesson_id,
                msg.recipient_id,
                msg.recipient_role,
                msg.body,
                ts
            ],
        )
        .map(|_| ())
        .map_err(|e| e.to_string())
    }
}
