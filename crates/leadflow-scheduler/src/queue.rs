//! Durable step queue on SQLite: the dispatcher workers consume from.
//!
//! One table holds every pending step. A claim leases the row for
//! `lease` instead of deleting it; the worker acks (deletes) once the
//! lifecycle controller is done. A crashed or aborted handler simply lets
//! the lease run out and the step is delivered again.
//!
//! ```text
//! schedule(msg, delay) → INSERT available_at = now + delay
//! claim(kind)          → UPDATE … SET available_at = now + lease RETURNING
//! ack(delivery)        → DELETE
//! ```

use async_trait::async_trait;
use leadflow_core::traits::Dispatcher;
use leadflow_core::{Envelope, LeadflowError, Result, StepKind, StepMessage};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A leased queue entry.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub seq: i64,
    /// How many times this row has been claimed, this one included.
    pub deliveries: u32,
    pub envelope: Envelope,
}

impl Delivery {
    pub fn message(&self) -> &StepMessage {
        &self.envelope.data
    }
}

pub struct SqliteQueue {
    conn: Mutex<Connection>,
    lease: Duration,
}

fn db_err(e: rusqlite::Error) -> LeadflowError {
    LeadflowError::infra(format!("queue: {e}"))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl SqliteQueue {
    pub fn open(path: &Path, lease: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        // Store and queue share the file; wait out each other's write locks.
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        Self::with_connection(conn, lease)
    }

    pub fn open_in_memory(lease: Duration) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?, lease)
    }

    fn with_connection(conn: Connection, lease: Duration) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS step_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                message_id TEXT NOT NULL,
                payload TEXT NOT NULL,            -- JSON envelope
                available_at INTEGER NOT NULL,    -- unix millis
                deliveries INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_step_queue_ready ON step_queue(kind, available_at);
        ",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lease,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LeadflowError::infra(format!("queue lock poisoned: {e}")))
    }

    /// Lease the oldest ready message of `kind`.
    pub fn claim(&self, kind: StepKind) -> Result<Option<Delivery>> {
        loop {
            let now = now_millis();
            let row = self
                .lock()?
                .query_row(
                    "UPDATE step_queue
                     SET available_at = ?1, deliveries = deliveries + 1
                     WHERE seq = (
                        SELECT seq FROM step_queue
                        WHERE kind = ?2 AND available_at <= ?3
                        ORDER BY available_at, seq LIMIT 1
                     )
                     RETURNING seq, payload, deliveries",
                    rusqlite::params![
                        now.saturating_add(millis(self.lease)),
                        kind.node_type(),
                        now
                    ],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;

            let Some((seq, payload, deliveries)) = row else {
                return Ok(None);
            };

            match Envelope::decode(&payload) {
                Ok(envelope) => {
                    return Ok(Some(Delivery {
                        seq,
                        deliveries,
                        envelope,
                    }));
                }
                Err(e) => {
                    // Poison message: nothing can ever handle it.
                    tracing::warn!("☠️ Dropping undecodable {kind} message #{seq}: {e}");
                    self.delete(seq)?;
                }
            }
        }
    }

    /// Remove a finished delivery.
    pub fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.delete(delivery.seq)
    }

    fn delete(&self, seq: i64) -> Result<()> {
        self.lock()?
            .execute("DELETE FROM step_queue WHERE seq = ?1", [seq])
            .map_err(db_err)?;
        Ok(())
    }

    /// Messages of `kind` still queued, leased ones included.
    pub fn pending(&self, kind: StepKind) -> Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row(
                "SELECT COUNT(*) FROM step_queue WHERE kind = ?1",
                [kind.node_type()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl Dispatcher for SqliteQueue {
    async fn schedule(&self, message: StepMessage, delay: Duration) -> Result<()> {
        let payload = message.envelope().encode()?;
        self.lock()?
            .execute(
                "INSERT INTO step_queue (kind, message_id, payload, available_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    message.kind.node_type(),
                    message.id,
                    payload,
                    now_millis().saturating_add(millis(delay)),
                ],
            )
            .map_err(db_err)?;
        tracing::debug!(
            "📥 Queued {} for lead {} (attempt {}, delay {:?})",
            message.kind,
            message.lead_id,
            message.attempt,
            delay
        );
        Ok(())
    }
}
