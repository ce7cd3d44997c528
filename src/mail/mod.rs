pub mod directory;
pub mod gmail;

use crate::error::MailError;
use crate::message::{MessageId, MessageRef, RawMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One page of candidates, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub refs: Vec<MessageRef>,
    /// Token for the next (older) page, if the listing continues.
    pub next_page: Option<String>,
}

/// Read-only access to the mailbox being watched.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// List messages received at or after `since`, newest first, at most
    /// `page_size` per call. Pass the previous `next_page` to continue.
    async fn list_candidates(
        &self,
        since: DateTime<Utc>,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<Listing, MailError>;

    async fn fetch_message(&self, id: &MessageId) -> Result<RawMessage, MailError>;
}
