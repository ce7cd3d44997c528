use super::{Listing, MailSource};
use crate::error::MailError;
use crate::message::{MessageBody, MessageId, MessageRef, RawMessage};
use crate::normalization::BodyNormalizer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::path::{Path, PathBuf};

const FIXTURE_EXTENSIONS: [&str; 2] = ["eml", "txt"];
const SNIPPET_CHARS: usize = 200;

/// Parse a fixture email.
///
/// The header block holds `From:`, `Subject:`, `Date:` and `Labels:` lines
/// and ends at a `---` line or the first blank line. `Date` accepts RFC 2822
/// or RFC 3339; without it `fallback_received` is used.
pub fn parse_fixture(id: &str, content: &str, fallback_received: DateTime<Utc>) -> RawMessage {
    let mut sender = String::new();
    let mut subject = String::new();
    let mut received_at = None;
    let mut labels = Vec::new();
    let mut body_lines = Vec::new();
    let mut in_body = false;

    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if in_body {
            body_lines.push(line);
            continue;
        }
        if line.trim().is_empty() || line.trim() == "---" {
            in_body = true;
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            in_body = true;
            body_lines.push(line);
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "from" => sender = value.to_string(),
            "subject" => subject = value.to_string(),
            "date" => received_at = parse_date(value),
            "labels" => {
                labels = value
                    .split(',')
                    .map(|l| l.trim().to_uppercase())
                    .filter(|l| !l.is_empty())
                    .collect()
            }
            other => debug!("Ignoring fixture header '{other}'"),
        }
    }

    let body = body_lines.join("\n");
    let snippet: String = body_lines
        .iter()
        .take(3)
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(SNIPPET_CHARS)
        .collect();
    let body = if BodyNormalizer::new().looks_like_html(&body) {
        MessageBody::html(body)
    } else {
        MessageBody::plain(body)
    };

    RawMessage {
        id: MessageId::new(id),
        sender,
        subject,
        body,
        received_at: received_at.unwrap_or(fallback_received),
        labels,
        snippet,
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| warn!("Unparseable fixture date '{value}': {e}"))
        .ok()
}

/// Offline mailbox backed by a directory of fixture files.
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load(path: &Path) -> Result<RawMessage, MailError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MailError::Transient(format!("cannot read {}: {e}", path.display())))?;
        let modified = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(parse_fixture(&id, &content, modified))
    }

    async fn fixture_paths(&self) -> Result<Vec<PathBuf>, MailError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            MailError::Fatal(format!("cannot read mail directory {}: {e}", self.dir.display()))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MailError::Transient(e.to_string()))?
        {
            let path = entry.path();
            let is_fixture = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| FIXTURE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if is_fixture {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[async_trait]
impl MailSource for DirectorySource {
    async fn list_candidates(
        &self,
        since: DateTime<Utc>,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<Listing, MailError> {
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| MailError::Fatal(format!("invalid page token '{token}'")))?,
            None => 0,
        };

        let mut messages = Vec::new();
        for path in self.fixture_paths().await? {
            let message = Self::load(&path).await?;
            if message.received_at >= since {
                messages.push(message);
            }
        }
        // Newest first, as the Gmail API lists them.
        messages.sort_by(|a, b| (b.received_at, &b.id).cmp(&(a.received_at, &a.id)));

        let end = offset.saturating_add(page_size).min(messages.len());
        let next_page = (end < messages.len()).then(|| end.to_string());
        let refs = messages
            .into_iter()
            .skip(offset)
            .take(page_size)
            .map(|m| MessageRef { id: m.id })
            .collect();
        Ok(Listing { refs, next_page })
    }

    async fn fetch_message(&self, id: &MessageId) -> Result<RawMessage, MailError> {
        for path in self.fixture_paths().await? {
            if path.file_stem().is_some_and(|stem| stem == id.as_str()) {
                return Self::load(&path).await;
            }
        }
        Err(MailError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::default()
    }

    #[test]
    fn test_parse_fixture_headers_and_body() {
        let content = "From: TLScontact <noreply@tlscontact.com>\n\
                       Subject: Confirmation\n\
                       Date: Mon, 05 Jan 2026 09:12:00 +0100\n\
                       Labels: inbox, spam\n\
                       ---\n\
                       Bonjour,\n\
                       Votre rendez-vous: 15/01/2026";

        let message = parse_fixture("one", content, epoch());

        assert_eq!(message.id, MessageId::new("one"));
        assert_eq!(message.sender, "TLScontact <noreply@tlscontact.com>");
        assert_eq!(message.subject, "Confirmation");
        assert_eq!(
            message.received_at,
            Utc.with_ymd_and_hms(2026, 1, 5, 8, 12, 0).unwrap()
        );
        assert_eq!(message.labels, vec!["INBOX", "SPAM"]);
        assert_eq!(
            message.body.text.as_deref(),
            Some("Bonjour,\nVotre rendez-vous: 15/01/2026")
        );
    }

    #[test]
    fn test_blank_line_ends_headers_and_html_detected() {
        let content = "From: a@tlscontact.com\n\n<p>Hello</p>";
        let message = parse_fixture("two", content, epoch());
        assert_eq!(message.body.html.as_deref(), Some("<p>Hello</p>"));
        assert_eq!(message.received_at, epoch());
    }

    #[tokio::test]
    async fn test_directory_listing_filters_sorts_and_limits() {
        let dir = TempDir::new().unwrap();
        let write = |name: &str, date: &str| {
            std::fs::write(
                dir.path().join(name),
                format!("From: a@tlscontact.com\nDate: {date}\n---\nbody"),
            )
            .unwrap();
        };
        write("late.txt", "2026-01-03T10:00:00Z");
        write("early.eml", "2026-01-02T10:00:00Z");
        write("old.txt", "2025-12-01T10:00:00Z");
        write("ignored.pdf", "2026-01-04T10:00:00Z");

        let source = DirectorySource::new(dir.path());
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let listing = source.list_candidates(since, 10, None).await.unwrap();
        let ids: Vec<&str> = listing.refs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["late", "early"]);
        assert_eq!(listing.next_page, None);

        let first = source.list_candidates(since, 1, None).await.unwrap();
        assert_eq!(first.refs[0].id, MessageId::new("late"));
        assert_eq!(first.next_page.as_deref(), Some("1"));

        let second = source
            .list_candidates(since, 1, first.next_page.as_deref())
            .await
            .unwrap();
        assert_eq!(second.refs[0].id, MessageId::new("early"));
        assert_eq!(second.next_page, None);

        let fetched = source.fetch_message(&MessageId::new("late")).await.unwrap();
        assert_eq!(fetched.body.text.as_deref(), Some("body"));
        assert!(matches!(
            source.fetch_message(&MessageId::new("missing")).await,
            Err(MailError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_directory_is_fatal() {
        let source = DirectorySource::new("/nonexistent/appointment-watcher-fixtures");
        let err = source.list_candidates(epoch(), 10, None).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
