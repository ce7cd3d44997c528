use crate::error::LedgerError;
use crate::message::{Checkpoint, MessageId};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

/// Terminal outcome recorded for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    Notified,
    NotAppointment,
    FailedPermanently,
    /// Deferred by quota and discarded under the `drop` backlog policy.
    Dropped,
}

impl LedgerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOutcome::Notified => "notified",
            LedgerOutcome::NotAppointment => "not_appointment",
            LedgerOutcome::FailedPermanently => "failed_permanently",
            LedgerOutcome::Dropped => "dropped",
        }
    }
}

impl fmt::Display for LedgerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerOutcome {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notified" => Ok(LedgerOutcome::Notified),
            "not_appointment" => Ok(LedgerOutcome::NotAppointment),
            "failed_permanently" => Ok(LedgerOutcome::FailedPermanently),
            "dropped" => Ok(LedgerOutcome::Dropped),
            other => Err(LedgerError::Corrupt(format!("unknown outcome '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub message_id: MessageId,
    pub processed_at: DateTime<Utc>,
    pub outcome: LedgerOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Recorded,
    /// Same outcome was already stored; nothing written.
    AlreadyRecorded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total: u64,
    pub notified: u64,
    pub not_appointment: u64,
    pub failed_permanently: u64,
    pub dropped: u64,
    pub latest_processed_at: Option<DateTime<Utc>>,
    pub checkpoint: Option<Checkpoint>,
}

/// Durable record of processed messages and the mail-stream checkpoint.
///
/// Entries are write-once: committing a different outcome for a known
/// identifier fails with [`LedgerError::Conflict`] and leaves the stored
/// entry untouched.
pub trait Ledger: Send + Sync {
    fn has(&self, id: &MessageId) -> Result<bool, LedgerError>;
    fn get(&self, id: &MessageId) -> Result<Option<LedgerEntry>, LedgerError>;
    fn commit(&self, id: &MessageId, outcome: LedgerOutcome) -> Result<CommitStatus, LedgerError>;
    fn checkpoint(&self) -> Result<Option<Checkpoint>, LedgerError>;
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), LedgerError>;
    fn stats(&self) -> Result<LedgerStats, LedgerError>;
}

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("Ledger {} opened (journal_mode={journal_mode})", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.pragma_update(None, "synchronous", "FULL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS processed_messages (
                message_id TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL,
                outcome TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_processed_at ON processed_messages(processed_at)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoint (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                received_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Corrupt("ledger connection lock poisoned".to_string()))
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn lookup(conn: &Connection, id: &MessageId) -> Result<Option<LedgerEntry>, LedgerError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT processed_at, outcome FROM processed_messages WHERE message_id = ?1",
            params![id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(processed_at, outcome)| {
        Ok(LedgerEntry {
            message_id: id.clone(),
            processed_at: parse_timestamp(&processed_at)?,
            outcome: outcome.parse()?,
        })
    })
    .transpose()
}

impl Ledger for SqliteLedger {
    fn has(&self, id: &MessageId) -> Result<bool, LedgerError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_messages WHERE message_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get(&self, id: &MessageId) -> Result<Option<LedgerEntry>, LedgerError> {
        let conn = self.conn()?;
        lookup(&conn, id)
    }

    fn commit(&self, id: &MessageId, outcome: LedgerOutcome) -> Result<CommitStatus, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = lookup(&tx, id)? {
            return if existing.outcome == outcome {
                Ok(CommitStatus::AlreadyRecorded)
            } else {
                Err(LedgerError::Conflict {
                    id: id.clone(),
                    existing: existing.outcome,
                    attempted: outcome,
                })
            };
        }

        tx.execute(
            "INSERT INTO processed_messages (message_id, processed_at, outcome) VALUES (?1, ?2, ?3)",
            params![id.as_str(), Utc::now().to_rfc3339(), outcome.as_str()],
        )?;
        tx.commit()?;
        Ok(CommitStatus::Recorded)
    }

    fn checkpoint(&self) -> Result<Option<Checkpoint>, LedgerError> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT received_at, updated_at FROM checkpoint WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(received_at, updated_at)| {
            Ok(Checkpoint {
                received_at: parse_timestamp(&received_at)?,
                updated_at: parse_timestamp(&updated_at)?,
            })
        })
        .transpose()
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO checkpoint (id, received_at, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET received_at = excluded.received_at,
                                           updated_at = excluded.updated_at",
            params![
                checkpoint.received_at.to_rfc3339(),
                checkpoint.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let mut stats = LedgerStats::default();
        {
            let conn = self.conn()?;
            let mut stmt =
                conn.prepare("SELECT outcome, COUNT(*) FROM processed_messages GROUP BY outcome")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

            for row in rows {
                let (outcome, count) = row?;
                let count = count.max(0) as u64;
                stats.total += count;
                match outcome.parse::<LedgerOutcome>()? {
                    LedgerOutcome::Notified => stats.notified = count,
                    LedgerOutcome::NotAppointment => stats.not_appointment = count,
                    LedgerOutcome::FailedPermanently => stats.failed_permanently = count,
                    LedgerOutcome::Dropped => stats.dropped = count,
                }
            }

            let latest: Option<String> =
                conn.query_row("SELECT MAX(processed_at) FROM processed_messages", [], |row| row.get(0))?;
            stats.latest_processed_at = latest.as_deref().map(parse_timestamp).transpose()?;
        }
        stats.checkpoint = self.checkpoint()?;
        Ok(stats)
    }
}
