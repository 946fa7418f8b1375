//! Runtime configuration and session credential sourcing.
//!
//! Settings are env-first with sane defaults. The session cookie is the one
//! piece of state that rotates underneath a running process (the operator
//! re-authenticates in a browser and updates the credentials file), so it is
//! re-read on every loop iteration instead of being captured at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

/// Lower bound for the digest poll; the broadcast document is served by a
/// third party and polling it faster than this is just rude.
const MIN_DIGEST_POLL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Storefront origin, e.g. `https://starvell.com`.
    pub base_url: String,
    /// Telegram bot token. Absent token disables delivery (dry operation).
    pub bot_token: Option<String>,
    pub telegram_api_base: String,
    /// SQLite ledger location.
    pub ledger_path: PathBuf,
    /// Optional JSON credentials file holding `SESSION_COOKIE`, re-read
    /// every loop iteration. Falls back to the `SESSION_COOKIE` env var.
    pub credentials_path: Option<PathBuf>,
    pub chat_poll_interval: Duration,
    pub orders_poll_interval: Duration,
    pub digest_poll_interval: Duration,
    pub bump_interval: Duration,
    /// Client-side timeout applied to every upstream call.
    pub http_timeout: Duration,
    /// Broadcast document id on the feed host.
    pub digest_doc_id: String,
    /// Preferred file name inside the broadcast document.
    pub digest_file: String,
    /// The single feed identity whose comments are forwarded.
    pub digest_author_id: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: "https://starvell.com".to_string(),
            bot_token: None,
            telegram_api_base: "https://api.telegram.org".to_string(),
            ledger_path: PathBuf::from("sellwatch.sqlite3"),
            credentials_path: None,
            chat_poll_interval: Duration::from_secs(5),
            orders_poll_interval: Duration::from_secs(10),
            digest_poll_interval: Duration::from_secs(120),
            bump_interval: Duration::from_secs(1800),
            http_timeout: Duration::from_secs(20),
            digest_doc_id: "89e52dbb3ca81aee82b6a3d8b51b55e2".to_string(),
            digest_file: "cxh.json".to_string(),
            digest_author_id: 71_018_041,
        }
    }
}

impl Settings {
    /// Load overrides from environment variables (if set).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("MARKET_BASE_URL") {
            if !v.trim().is_empty() {
                cfg.base_url = v.trim_end_matches('/').to_string();
            }
        }
        if let Ok(v) = std::env::var("BOT_TOKEN") {
            if !v.trim().is_empty() {
                cfg.bot_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("TELEGRAM_API_BASE") {
            if !v.trim().is_empty() {
                cfg.telegram_api_base = v.trim_end_matches('/').to_string();
            }
        }
        if let Ok(v) = std::env::var("LEDGER_PATH") {
            if !v.trim().is_empty() {
                cfg.ledger_path = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("CREDENTIALS_FILE") {
            if !v.trim().is_empty() {
                cfg.credentials_path = Some(PathBuf::from(v));
            }
        }
        if let Some(secs) = env_secs("CHAT_POLL_INTERVAL") {
            cfg.chat_poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_secs("ORDERS_POLL_INTERVAL") {
            cfg.orders_poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_secs("DIGEST_POLL_INTERVAL") {
            cfg.digest_poll_interval = Duration::from_secs(secs.max(MIN_DIGEST_POLL_SECS));
        }
        if let Some(secs) = env_secs("BUMP_INTERVAL") {
            cfg.bump_interval = Duration::from_secs(secs.max(60));
        }
        if let Some(secs) = env_secs("HTTP_TIMEOUT") {
            cfg.http_timeout = Duration::from_secs(secs.max(1));
        }
        if let Ok(v) = std::env::var("DIGEST_DOC_ID") {
            if !v.trim().is_empty() {
                cfg.digest_doc_id = v;
            }
        }
        if let Ok(v) = std::env::var("DIGEST_FILE") {
            if !v.trim().is_empty() {
                cfg.digest_file = v;
            }
        }
        if let Some(id) = std::env::var("DIGEST_AUTHOR_ID")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
        {
            cfg.digest_author_id = id;
        }
        cfg
    }
}

fn env_secs(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// Credentials attached to every upstream call: the browser session cookie
/// plus the secondary `sid` token handed back by the auth probe.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub session: SecretString,
    pub sid: Option<String>,
}

impl SessionCredentials {
    pub fn new(session: SecretString) -> Self {
        Self { session, sid: None }
    }

    pub fn with_sid(mut self, sid: Option<String>) -> Self {
        if sid.as_deref().is_some_and(|s| !s.is_empty()) {
            self.sid = sid;
        }
        self
    }
}

/// On-disk shape of the credentials file. Extra keys are ignored so the file
/// can be shared with other tooling.
#[derive(Debug, Deserialize)]
struct CredentialFile {
    #[serde(rename = "SESSION_COOKIE", default)]
    session_cookie: Option<String>,
}

/// Re-reads the session cookie on demand. Loops call [`current`] once per
/// iteration so an externally rotated cookie is picked up without a restart.
///
/// [`current`]: CredentialSource::current
#[derive(Debug, Clone)]
pub struct CredentialSource {
    path: Option<PathBuf>,
}

impl CredentialSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn current(&self) -> Option<SessionCredentials> {
        if let Some(path) = &self.path {
            if let Some(cookie) = read_cookie_file(path) {
                return Some(SessionCredentials::new(SecretString::from(cookie)));
            }
        }
        std::env::var("SESSION_COOKIE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| SessionCredentials::new(SecretString::from(v)))
    }
}

fn read_cookie_file(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: CredentialFile = serde_json::from_str(&raw).ok()?;
    parsed
        .session_cookie
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
