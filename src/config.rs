use crate::dispatch::retry::RetryPolicy;
use crate::parser::links::{default_ignored_link_patterns, default_link_hosts};
use crate::parser::location::LocationAnchors;
use crate::parser::{Locale, NumericDateOrder};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One week.
pub const MAX_OVERLAP_SECS: u64 = 7 * 24 * 3600;
/// One year.
pub const MAX_LOOKBACK_HOURS: u64 = 365 * 24;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watcher: WatcherConfig,
    pub parser: ParserConfig,
    pub dispatch: DispatchConfig,
    pub telegram: TelegramConfig,
    pub mail: MailConfig,
    pub ledger: LedgerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// What to do with an appointment that found the cycle quota exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogPolicy {
    /// Leave it uncommitted so the next cycle picks it up again.
    #[default]
    Defer,
    /// Record it as dropped; it will never be notified.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_secs: u64,
    pub fetch_limit: usize,
    /// Re-scan window before the checkpoint, absorbing provider clock skew.
    pub overlap_secs: u64,
    /// How far back the very first cycle looks.
    pub initial_lookback_hours: u64,
    pub backlog_policy: BacklogPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            fetch_limit: 10,
            overlap_secs: 3600,
            initial_lookback_hours: 24,
            backlog_policy: BacklogPolicy::Defer,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Clamped to `MAX_OVERLAP_SECS`; `Config::validate` rejects larger values.
    pub fn overlap(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.overlap_secs.min(MAX_OVERLAP_SECS) as i64)
    }

    /// Clamped to `MAX_LOOKBACK_HOURS`.
    pub fn initial_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.initial_lookback_hours.min(MAX_LOOKBACK_HOURS) as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub sender_domains: Vec<String>,
    /// Enabled date/location languages, in priority order.
    pub locales: Vec<Locale>,
    pub numeric_date_order: NumericDateOrder,
    pub location_anchors: LocationAnchors,
    pub link_hosts: Vec<String>,
    pub ignored_link_patterns: Vec<String>,
    /// Emit records that have only a date or only a link.
    pub emit_low_confidence: bool,
}

fn tls_domains() -> Vec<String> {
    ["tlscontact.com", "tls-contact.com", "tlsvisa.com", "tls-contact.fr"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ParserConfig {
    fn default() -> Self {
        let mut link_hosts = default_link_hosts();
        link_hosts.extend(tls_domains().into_iter().filter(|d| d != "tlscontact.com"));
        Self {
            sender_domains: tls_domains(),
            locales: vec![Locale::French, Locale::English],
            numeric_date_order: NumericDateOrder::DayFirst,
            location_anchors: LocationAnchors::default(),
            link_hosts,
            ignored_link_patterns: default_ignored_link_patterns(),
            emit_low_confidence: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_sends_per_cycle: u32,
    /// Total attempts per notification, first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_sends_per_cycle: 3,
            max_attempts: 4,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            attempt_timeout_secs: 15,
        }
    }
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub api_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: crate::dispatch::telegram::DEFAULT_API_BASE.to_string(),
            bot_token: None,
            chat_id: None,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailSourceKind {
    #[default]
    Gmail,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub source: MailSourceKind,
    /// Fixture directory for the `directory` source.
    pub directory: String,
    pub request_timeout_secs: u64,
    pub gmail: GmailConfig,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            source: MailSourceKind::Gmail,
            directory: "fixtures".to_string(),
            request_timeout_secs: 30,
            gmail: GmailConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    pub user: String,
    pub query: String,
    pub extra_query: String,
    /// Include spam and trash in the search.
    pub search_anywhere: bool,
    pub api_base: String,
    pub token_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            user: "me".to_string(),
            query: "from:(tlscontact.com)".to_string(),
            extra_query: String::new(),
            search_anywhere: true,
            api_base: "https://gmail.googleapis.com".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            client_id: None,
            client_secret: None,
            refresh_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: "data/processed.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file: {path}"))?;
        Ok(())
    }

    /// Secrets and deployment paths from the environment win over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(v);
        }
        if let Some(v) = get("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = Some(v);
        }
        if let Some(v) = get("GOOGLE_CLIENT_ID") {
            self.mail.gmail.client_id = Some(v);
        }
        if let Some(v) = get("GOOGLE_CLIENT_SECRET") {
            self.mail.gmail.client_secret = Some(v);
        }
        if let Some(v) = get("GOOGLE_REFRESH_TOKEN") {
            self.mail.gmail.refresh_token = Some(v);
        }
        if let Some(v) = get("GOOGLE_USER_EMAIL") {
            self.mail.gmail.user = v;
        }
        if let Some(v) = get("LEDGER_PATH") {
            self.ledger.path = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.watcher.fetch_limit == 0 {
            bail!("watcher.fetch_limit must be at least 1");
        }
        if self.watcher.poll_interval_secs == 0 {
            bail!("watcher.poll_interval_secs must be at least 1");
        }
        if self.watcher.overlap_secs > MAX_OVERLAP_SECS {
            bail!("watcher.overlap_secs cannot exceed {MAX_OVERLAP_SECS}");
        }
        if self.watcher.initial_lookback_hours > MAX_LOOKBACK_HOURS {
            bail!("watcher.initial_lookback_hours cannot exceed {MAX_LOOKBACK_HOURS}");
        }
        if self.parser.sender_domains.is_empty() {
            bail!("parser.sender_domains must not be empty");
        }
        if self.parser.locales.is_empty() {
            bail!("parser.locales must list at least one locale");
        }
        if self.parser.link_hosts.is_empty() {
            bail!("parser.link_hosts must not be empty");
        }
        for pattern in &self.parser.ignored_link_patterns {
            regex::Regex::new(pattern)
                .with_context(|| format!("Invalid parser.ignored_link_patterns entry: {pattern}"))?;
        }
        if self.dispatch.max_attempts == 0 {
            bail!("dispatch.max_attempts must be at least 1");
        }
        if self.dispatch.base_delay_ms > self.dispatch.max_delay_ms {
            bail!("dispatch.base_delay_ms cannot exceed dispatch.max_delay_ms");
        }
        if self.dispatch.attempt_timeout_secs == 0 {
            bail!("dispatch.attempt_timeout_secs must be at least 1");
        }
        if self.ledger.path.trim().is_empty() {
            bail!("ledger.path must not be empty");
        }
        self.server
            .bind
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid server.bind address: {}", self.server.bind))?;
        Ok(())
    }

    /// Names of secrets the configured collaborators still need.
    pub fn missing_secrets(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.telegram.bot_token.is_none() {
            missing.push("TELEGRAM_BOT_TOKEN");
        }
        if self.telegram.chat_id.is_none() {
            missing.push("TELEGRAM_CHAT_ID");
        }
        if self.mail.source == MailSourceKind::Gmail {
            let gmail = &self.mail.gmail;
            if gmail.client_id.is_none() {
                missing.push("GOOGLE_CLIENT_ID");
            }
            if gmail.client_secret.is_none() {
                missing.push("GOOGLE_CLIENT_SECRET");
            }
            if gmail.refresh_token.is_none() {
                missing.push("GOOGLE_REFRESH_TOKEN");
            }
        }
        missing
    }
}
