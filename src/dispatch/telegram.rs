use super::Notifier;
use crate::error::SendError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Bot API `sendMessage` client.
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl TelegramNotifier {
    pub fn new(
        api_base: &str,
        bot_token: &str,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("appointment-watcher/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, chat_target: &str, html: &str) -> Result<(), SendError> {
        let payload = json!({
            "chat_id": chat_target,
            "text": html,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        // The bot token is part of the URL; keep it out of error text.
        let response = self
            .client
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|e| SendError::Transient(e.without_url().to_string()))?;

        let status = response.status();
        let body: Option<ApiResponse> = response.json().await.ok();
        classify_response(status, body)
    }
}

fn classify_response(status: StatusCode, body: Option<ApiResponse>) -> Result<(), SendError> {
    let description = body
        .as_ref()
        .and_then(|b| b.description.clone())
        .unwrap_or_else(|| status.to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = body
            .as_ref()
            .and_then(|b| b.parameters.as_ref())
            .and_then(|p| p.retry_after)
            .map(Duration::from_secs);
        return Err(SendError::RateLimited { retry_after });
    }
    if status.is_server_error() {
        return Err(SendError::Transient(description));
    }
    if status.is_client_error() {
        return Err(SendError::Permanent(description));
    }
    if !status.is_success() {
        return Err(SendError::Transient(description));
    }

    match body {
        Some(body) if !body.ok => Err(SendError::Permanent(description)),
        _ => Ok(()),
    }
}
