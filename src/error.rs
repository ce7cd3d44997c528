use crate::ledger::LedgerOutcome;
use crate::message::MessageId;
use std::time::Duration;

/// Failures reported by a mail collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MailError {
    #[error("transient mail error: {0}")]
    Transient(String),
    /// Needs operator attention (revoked grant, missing credentials).
    #[error("fatal mail error: {0}")]
    Fatal(String),
    #[error("message not found: {0}")]
    NotFound(String),
}

impl MailError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, MailError::Fatal(_))
    }
}

/// Failures reported by the outbound notification channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("transient delivery error: {0}")]
    Transient(String),
    #[error("rate limited by channel (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("permanent delivery error: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SendError::Permanent(_))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch quota exhausted for this cycle")]
    QuotaExceeded,
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: SendError },
    #[error("delivery permanently rejected: {0}")]
    Permanent(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger conflict for {id}: already recorded as {existing}, refused {attempted}")]
    Conflict {
        id: MessageId,
        existing: LedgerOutcome,
        attempted: LedgerOutcome,
    },
    #[error("ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("ledger holds unreadable data: {0}")]
    Corrupt(String),
    #[error("ledger directory error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("fetch failed, cycle aborted: {0}")]
    Fetch(MailError),
    #[error("fatal error, operator action required: {0}")]
    Fatal(MailError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<MailError> for WatcherError {
    fn from(err: MailError) -> Self {
        if err.is_fatal() {
            WatcherError::Fatal(err)
        } else {
            WatcherError::Fetch(err)
        }
    }
}
