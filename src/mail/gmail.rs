use super::{Listing, MailSource};
use crate::config::GmailConfig;
use crate::error::MailError;
use crate::message::{MessageBody, MessageId, MessageRef, RawMessage};
use async_trait::async_trait;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Gmail hands out unpadded base64url; accept either form.
const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Refresh this long before the token actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Default, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<ListedMessage>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    #[serde(default)]
    data: Option<String>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Gmail REST client using the OAuth refresh-token flow.
pub struct GmailSource {
    client: Client,
    api_base: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    user: String,
    query: String,
    extra_query: String,
    search_anywhere: bool,
    token: Mutex<Option<AccessToken>>,
}

impl GmailSource {
    pub fn new(config: &GmailConfig, request_timeout: Duration) -> Result<Self, MailError> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| MailError::Fatal(format!("missing Gmail credential: {name}")))
        };

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| MailError::Fatal(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            client_id: required(&config.client_id, "client_id")?,
            client_secret: required(&config.client_secret, "client_secret")?,
            refresh_token: required(&config.refresh_token, "refresh_token")?,
            user: config.user.clone(),
            query: config.query.clone(),
            extra_query: config.extra_query.clone(),
            search_anywhere: config.search_anywhere,
            token: Mutex::new(None),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/gmail/v1/users/{}/messages",
            self.api_base,
            urlencoding::encode(&self.user)
        )
    }

    /// Search expression for messages received after `since`.
    pub fn search_query(&self, since: DateTime<Utc>) -> String {
        let mut query = String::new();
        if self.search_anywhere {
            query.push_str("in:anywhere ");
        }
        query.push_str(&format!("({}) after:{}", self.query, since.timestamp()));
        if !self.extra_query.trim().is_empty() {
            query.push(' ');
            query.push_str(self.extra_query.trim());
        }
        query
    }

    async fn access_token(&self, force_refresh: bool) -> Result<String, MailError> {
        let mut cached = self.token.lock().await;
        if !force_refresh {
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                    return Ok(token.value.clone());
                }
            }
        }

        debug!("Refreshing Gmail access token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| MailError::Transient(format!("token refresh failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error: TokenError = response.json().await.unwrap_or_default();
            let detail = error.error_description.unwrap_or_else(|| status.to_string());
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                MailError::Transient(format!("token endpoint returned {status}: {detail}"))
            } else {
                // invalid_grant means the refresh token was revoked or expired.
                MailError::Fatal(format!("token refresh rejected ({}): {detail}", error.error))
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| MailError::Transient(format!("unreadable token response: {e}")))?;
        let value = token.access_token.clone();
        *cached = Some(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    /// Send an authorized request, refreshing the token once on 401.
    async fn send_authorized<F>(&self, build: F) -> Result<Response, MailError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let mut refreshed = false;
        loop {
            let token = self.access_token(refreshed).await?;
            let response = build(&token)
                .send()
                .await
                .map_err(|e| MailError::Transient(format!("Gmail request failed: {e}")))?;

            if response.status() == StatusCode::UNAUTHORIZED {
                if refreshed {
                    return Err(MailError::Fatal(
                        "Gmail rejected a freshly refreshed token".to_string(),
                    ));
                }
                warn!("Gmail returned 401, refreshing token");
                refreshed = true;
                continue;
            }
            return Ok(response);
        }
    }
}

fn status_error(status: StatusCode, what: &str) -> MailError {
    if status == StatusCode::NOT_FOUND {
        MailError::NotFound(what.to_string())
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        MailError::Transient(format!("{what}: Gmail returned {status}"))
    } else {
        MailError::Fatal(format!("{what}: Gmail returned {status}"))
    }
}

#[async_trait]
impl MailSource for GmailSource {
    async fn list_candidates(
        &self,
        since: DateTime<Utc>,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<Listing, MailError> {
        let query = self.search_query(since);
        debug!("Listing Gmail messages: {query} (page {page_token:?})");

        let url = self.messages_url();
        let max_results = page_size.to_string();
        let include_spam_trash = self.search_anywhere.to_string();
        let mut params = vec![
            ("q", query.as_str()),
            ("maxResults", max_results.as_str()),
            ("includeSpamTrash", include_spam_trash.as_str()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        let response = self
            .send_authorized(|token| self.client.get(&url).bearer_auth(token).query(&params))
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "list messages"));
        }

        let listing: ListResponse = response
            .json()
            .await
            .map_err(|e| MailError::Transient(format!("unreadable listing: {e}")))?;

        let refs: Vec<MessageRef> = listing
            .messages
            .into_iter()
            .take(page_size)
            .map(|m| MessageRef {
                id: MessageId::new(m.id),
            })
            .collect();
        info!("Found {} candidate message(s)", refs.len());

        Ok(Listing {
            refs,
            next_page: listing.next_page_token,
        })
    }

    async fn fetch_message(&self, id: &MessageId) -> Result<RawMessage, MailError> {
        let url = format!("{}/{}", self.messages_url(), urlencoding::encode(id.as_str()));
        let response = self
            .send_authorized(|token| {
                self.client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("format", "full")])
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, id.as_str()));
        }

        let message: GmailMessage = response
            .json()
            .await
            .map_err(|e| MailError::Transient(format!("unreadable message {id}: {e}")))?;
        Ok(into_raw_message(message))
    }
}

fn header<'a>(part: &'a MessagePart, name: &str) -> Option<&'a str> {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn decode_base64url(data: &str) -> Option<String> {
    match BASE64URL.decode(data.trim()) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!("Failed to decode message part: {e}");
            None
        }
    }
}

/// Walk the MIME tree collecting text and HTML parts, attachments included.
fn collect_parts(part: &MessagePart, html: &mut Vec<String>, text: &mut Vec<String>) {
    let data = part.body.as_ref().and_then(|b| b.data.as_deref());
    if let Some(content) = data.and_then(decode_base64url) {
        match part.mime_type.as_str() {
            "text/html" => html.push(content),
            "text/plain" => text.push(content),
            _ => {}
        }
        if !part.filename.is_empty() {
            debug!("Included attachment {}", part.filename);
        }
    }
    for child in &part.parts {
        collect_parts(child, html, text);
    }
}

fn into_raw_message(message: GmailMessage) -> RawMessage {
    let payload = message.payload.unwrap_or_default();

    let mut html = Vec::new();
    let mut text = Vec::new();
    collect_parts(&payload, &mut html, &mut text);

    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(|| {
            warn!("Message {} has no internalDate", message.id);
            DateTime::<Utc>::default()
        });

    RawMessage {
        id: MessageId::new(message.id),
        sender: header(&payload, "From").unwrap_or_default().to_string(),
        subject: header(&payload, "Subject").unwrap_or_default().to_string(),
        body: MessageBody {
            text: (!text.is_empty()).then(|| text.join("\n---\n")),
            html: (!html.is_empty()).then(|| html.join("\n<hr>\n")),
        },
        received_at,
        labels: message.label_ids,
        snippet: message.snippet,
    }
}
