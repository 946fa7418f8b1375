//! Notification rendering and fan-out.
//!
//! Watchers decide *what* is new; this module decides how it reads and hands
//! it to the delivery transport. The [`Notify`] trait is the outward-facing
//! boundary: callers pass an already-rendered message and the full recipient
//! list, and a returned error only means "do not advance your cursor yet".

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::types::{DigestPayload, Listing, Order, SessionUser};

/// A single labeled URL button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub url: String,
}

/// Transport-agnostic rendered notification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedMessage {
    pub text: String,
    pub photo_url: Option<String>,
    /// Button grid: outer Vec is rows.
    pub buttons: Vec<Vec<Button>>,
    pub pin: bool,
}

#[async_trait]
pub trait Notify: Send + Sync {
    /// Deliver `message` to every recipient. An empty recipient list is a
    /// successful no-op. Partial delivery failure returns an error so the
    /// caller retries next cycle (at-least-once).
    async fn notify(&self, recipients: &[i64], message: &RenderedMessage) -> anyhow::Result<()>;
}

// ─────────────────────────────────────────────────────────
// Text helpers
// ─────────────────────────────────────────────────────────

pub fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Render a minor-unit amount ("12345" → "123.45").
pub fn format_minor_units(value: i64) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Clip long chat content for the notification body.
pub fn truncate_snippet(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Pull `[label|url]` lines out of freeform text into button rows, stripping
/// the matched lines from the returned text. Lines that do not parse cleanly
/// are kept verbatim.
pub fn extract_inline_buttons(raw: &str) -> (String, Vec<Vec<Button>>) {
    let mut kept = Vec::new();
    let mut rows = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if !(trimmed.starts_with('[') && trimmed.contains('|')) {
            kept.push(line);
            continue;
        }
        let inner = trimmed
            .strip_prefix('[')
            .unwrap_or(trimmed)
            .trim_end_matches(']')
            .trim_end_matches('|');
        let Some((label, url)) = inner.split_once('|') else {
            kept.push(line);
            continue;
        };
        let label = label.trim();
        let mut url = url.trim().to_string();
        if !url.is_empty() && !url.to_lowercase().starts_with("http://")
            && !url.to_lowercase().starts_with("https://")
        {
            url = format!("https://{url}");
        }
        if label.is_empty() || url.is_empty() || url::Url::parse(&url).is_err() {
            kept.push(line);
            continue;
        }
        rows.push(vec![Button {
            label: label.to_string(),
            url,
        }]);
    }
    (kept.join("\n").trim().to_string(), rows)
}

// ─────────────────────────────────────────────────────────
// Render functions
// ─────────────────────────────────────────────────────────

pub fn render_chat_message(
    username: &str,
    text: &str,
    chat_id: &str,
    base_url: &str,
) -> RenderedMessage {
    RenderedMessage {
        text: format!(
            "📩 New message from <b>{}</b>:\n{}",
            escape_html(username),
            escape_html(text)
        ),
        buttons: vec![vec![Button {
            label: "Open chat".to_string(),
            url: format!("{base_url}/chat/{chat_id}"),
        }]],
        ..Default::default()
    }
}

pub fn render_new_order(order: &Order, base_url: &str) -> RenderedMessage {
    let id = order.id.as_deref().unwrap_or("-");
    RenderedMessage {
        text: format!(
            "🛒 New order <b>#{}</b>\nBuyer: {}\nItem: {} / {}\nQuantity: {}\nTotal: {} ₽",
            escape_html(id),
            escape_html(&order.buyer_label()),
            escape_html(order.game_name()),
            escape_html(order.category_name()),
            order.quantity.unwrap_or(1),
            format_minor_units(order.price_minor()),
        ),
        buttons: vec![vec![Button {
            label: "Open order".to_string(),
            url: format!("{base_url}/order/{id}"),
        }]],
        ..Default::default()
    }
}

pub fn render_completed_order(order: &Order, base_url: &str) -> RenderedMessage {
    let id = order.id.as_deref().unwrap_or("-");
    RenderedMessage {
        text: format!(
            "✅ Order <b>#{}</b> completed\nBuyer: {}\nItem: {} / {}\nTotal: {} ₽",
            escape_html(id),
            escape_html(&order.buyer_label()),
            escape_html(order.game_name()),
            escape_html(order.category_name()),
            format_minor_units(order.price_minor()),
        ),
        buttons: vec![vec![Button {
            label: "View order".to_string(),
            url: format!("{base_url}/order/{id}"),
        }]],
        ..Default::default()
    }
}

pub fn render_bump_success(listing: &Listing) -> RenderedMessage {
    let title = listing
        .title
        .as_deref()
        .or(listing.url.as_deref())
        .unwrap_or("Listing");
    let buttons = match listing.url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => vec![vec![Button {
            label: "Open listing".to_string(),
            url: url.to_string(),
        }]],
        None => Vec::new(),
    };
    RenderedMessage {
        text: format!("⬆️ Listing bumped: <b>{}</b>", escape_html(title)),
        buttons,
        ..Default::default()
    }
}

pub fn render_auth_status(
    authorized: bool,
    user: Option<&SessionUser>,
    base_url: &str,
) -> RenderedMessage {
    if !authorized {
        return RenderedMessage {
            text: "⚠️ Session is not authorized — update the session cookie.".to_string(),
            ..Default::default()
        };
    }
    let (name, id) = match user {
        Some(u) => (
            u.username.as_deref().unwrap_or("-"),
            u.id.as_deref().unwrap_or("-"),
        ),
        None => ("-", "-"),
    };
    let balance = user
        .and_then(|u| u.balance.as_ref())
        .and_then(|b| b.rub_balance)
        .map(format_minor_units)
        .unwrap_or_else(|| "-".to_string());
    let held = user
        .and_then(|u| u.holded_amount)
        .map(format_minor_units)
        .unwrap_or_else(|| "-".to_string());
    let rating = user
        .and_then(|u| u.rating)
        .map(|r| format!("{r:.1}"))
        .unwrap_or_else(|| "-".to_string());
    let buttons = match user.and_then(|u| u.id.as_deref()) {
        Some(uid) => vec![vec![Button {
            label: "Profile".to_string(),
            url: format!("{base_url}/users/{uid}"),
        }]],
        None => Vec::new(),
    };
    RenderedMessage {
        text: format!(
            "🔑 Session authorized as <b>{}</b> (id {})\nBalance: {} ₽ · On hold: {} ₽ · Rating: {}",
            escape_html(name),
            escape_html(id),
            balance,
            held,
            rating,
        ),
        buttons,
        ..Default::default()
    }
}

/// Render an operator broadcast. An explicit `kb` grid wins; otherwise
/// buttons are mined out of `[label|url]` lines in the text.
pub fn render_digest(payload: &DigestPayload) -> RenderedMessage {
    let mut rows: Vec<Vec<Button>> = Vec::new();
    if let Some(grid) = &payload.keyboard {
        for row in grid {
            let buttons: Vec<Button> = row
                .iter()
                .filter_map(|b| {
                    let label = b.text.as_deref()?.trim();
                    let url = b.url.as_deref()?.trim();
                    (!label.is_empty() && !url.is_empty()).then(|| Button {
                        label: label.to_string(),
                        url: url.to_string(),
                    })
                })
                .collect();
            if !buttons.is_empty() {
                rows.push(buttons);
            }
        }
    }
    let mut text = payload.text.as_deref().unwrap_or("").trim().to_string();
    if rows.is_empty() && !text.is_empty() {
        let (cleaned, extracted) = extract_inline_buttons(&text);
        if !extracted.is_empty() {
            text = cleaned;
            rows = extracted;
        }
    }
    RenderedMessage {
        text,
        photo_url: payload
            .photo
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string),
        buttons: rows,
        pin: payload.pin,
    }
}

// ─────────────────────────────────────────────────────────
// Telegram transport
// ─────────────────────────────────────────────────────────

pub struct TelegramNotifier {
    http: reqwest::Client,
    token: Option<String>,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(
        token: Option<String>,
        api_base: String,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn call(
        &self,
        token: &str,
        method: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}/bot{}/{}", self.api_base, token, method);
        let resp = self.http.post(&url).json(payload).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() || !body["ok"].as_bool().unwrap_or(false) {
            anyhow::bail!(
                "{method} failed (status {status}): {}",
                body["description"].as_str().unwrap_or("unknown error")
            );
        }
        Ok(body)
    }

    fn reply_markup(message: &RenderedMessage) -> Option<serde_json::Value> {
        if message.buttons.is_empty() {
            return None;
        }
        let rows: Vec<Vec<serde_json::Value>> = message
            .buttons
            .iter()
            .map(|row| {
                row.iter()
                    .map(|b| serde_json::json!({ "text": b.label, "url": b.url }))
                    .collect()
            })
            .collect();
        Some(serde_json::json!({ "inline_keyboard": rows }))
    }

    async fn send_one(
        &self,
        token: &str,
        chat_id: i64,
        message: &RenderedMessage,
    ) -> anyhow::Result<()> {
        let markup = Self::reply_markup(message);
        let body = if let Some(photo) = &message.photo_url {
            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "photo": photo,
                "parse_mode": "HTML",
            });
            if !message.text.is_empty() {
                payload["caption"] = serde_json::json!(message.text);
            }
            if let Some(markup) = &markup {
                payload["reply_markup"] = markup.clone();
            }
            self.call(token, "sendPhoto", &payload).await?
        } else {
            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": message.text,
                "parse_mode": "HTML",
                "link_preview_options": { "is_disabled": true },
            });
            if let Some(markup) = &markup {
                payload["reply_markup"] = markup.clone();
            }
            self.call(token, "sendMessage", &payload).await?
        };

        if message.pin {
            // pin failure is non-fatal; the message itself was delivered
            if let Some(message_id) = body["result"]["message_id"].as_i64() {
                let payload = serde_json::json!({ "chat_id": chat_id, "message_id": message_id });
                if let Err(err) = self.call(token, "pinChatMessage", &payload).await {
                    warn!(recipient = chat_id, error = %err, "pin failed");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Notify for TelegramNotifier {
    async fn notify(&self, recipients: &[i64], message: &RenderedMessage) -> anyhow::Result<()> {
        let Some(token) = self.token.as_deref() else {
            debug!("delivery disabled: no bot token configured");
            return Ok(());
        };
        if recipients.is_empty() {
            return Ok(());
        }
        let mut failures = 0usize;
        for &chat_id in recipients {
            if let Err(err) = self.send_one(token, chat_id, message).await {
                warn!(recipient = chat_id, error = %err, "notification delivery failed");
                failures += 1;
            }
        }
        if failures > 0 {
            anyhow::bail!("{failures}/{} deliveries failed", recipients.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_buttons_extracted_and_stripped() {
        let raw = "Maintenance tonight\n[Status page|status.example.com]\nBack at 02:00";
        let (text, rows) = extract_inline_buttons(raw);
        assert_eq!(text, "Maintenance tonight\nBack at 02:00");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].label, "Status page");
        assert_eq!(rows[0][0].url, "https://status.example.com");
    }

    #[test]
    fn malformed_button_lines_are_kept() {
        let raw = "[no url here]\n[|https://example.com]";
        let (text, rows) = extract_inline_buttons(raw);
        assert!(rows.is_empty());
        assert_eq!(text, raw);
    }

    #[test]
    fn minor_units_render_with_two_decimals() {
        assert_eq!(format_minor_units(12345), "123.45");
        assert_eq!(format_minor_units(5), "0.05");
        assert_eq!(format_minor_units(-250), "-2.50");
    }

    #[test]
    fn snippet_truncation() {
        let long = "x".repeat(600);
        let out = truncate_snippet(&long, 500);
        assert_eq!(out.chars().count(), 500);
        assert!(out.ends_with("..."));
        assert_eq!(truncate_snippet("  short  ", 500), "short");
    }

    #[test]
    fn chat_render_escapes_html() {
        let msg = render_chat_message("<buyer>", "1 < 2 & 3", "c1", "https://host");
        assert!(msg.text.contains("&lt;buyer&gt;"));
        assert!(msg.text.contains("1 &lt; 2 &amp; 3"));
        assert_eq!(msg.buttons[0][0].url, "https://host/chat/c1");
    }

    #[test]
    fn digest_explicit_grid_wins_over_extraction() {
        let payload: DigestPayload = serde_json::from_str(
            r#"{
                "text": "Update\n[Ignored|https://example.com/a]",
                "kb": [[{"text": "Open", "url": "https://example.com/b"}]],
                "pin": true
            }"#,
        )
        .unwrap();
        let msg = render_digest(&payload);
        assert!(msg.pin);
        assert_eq!(msg.buttons.len(), 1);
        assert_eq!(msg.buttons[0][0].url, "https://example.com/b");
        // text untouched when the explicit grid is used
        assert!(msg.text.contains("[Ignored|"));
    }

    #[test]
    fn digest_falls_back_to_inline_extraction() {
        let payload: DigestPayload = serde_json::from_str(
            r#"{"text": "News\n[Read|https://example.com/n]", "ph": " "}"#,
        )
        .unwrap();
        let msg = render_digest(&payload);
        assert_eq!(msg.text, "News");
        assert_eq!(msg.buttons[0][0].label, "Read");
        assert!(msg.photo_url.is_none());
    }
}
