//! Upstream response schemas.
//!
//! The storefront API is a loosely-typed JSON surface: ids arrive as numbers
//! or strings, most fields are optional, and several entities carry the same
//! value under two different keys. Every schema here makes absence a
//! first-class `Option` instead of guessing.

use serde::{Deserialize, Deserializer};

/// Normalize an upstream id to a comparable string. Numbers become their
/// decimal form, strings are trimmed, everything else (booleans, objects)
/// is treated as absent.
pub fn value_to_id(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(value_to_id))
}

// ─────────────────────────────────────────────────────────
// Session / auth probe
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Balance {
    #[serde(rename = "rubBalance", default)]
    pub rub_balance: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUser {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(rename = "holdedAmount", default)]
    pub holded_amount: Option<i64>,
    #[serde(default)]
    pub balance: Option<Balance>,
}

/// Result of the auth probe: whether the session cookie is still accepted,
/// the acting identity, and the secondary `sid` token for listing calls.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSnapshot {
    #[serde(default)]
    pub authorized: bool,
    #[serde(default)]
    pub user: Option<SessionUser>,
    #[serde(default)]
    pub sid: Option<String>,
}

impl AuthSnapshot {
    pub fn acting_user_id(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.id.as_deref())
    }
}

// ─────────────────────────────────────────────────────────
// Chats
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageMeta {
    #[serde(rename = "isAuto", default)]
    pub is_auto: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageAuthor {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatMessage {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(rename = "authorId", default, deserialize_with = "de_opt_id")]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author: Option<MessageAuthor>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: Option<MessageMeta>,
}

impl ChatMessage {
    /// Author id, preferring the flat `authorId` over the nested object.
    pub fn sender(&self) -> Option<&str> {
        self.author_id
            .as_deref()
            .or_else(|| self.author.as_ref().and_then(|a| a.id.as_deref()))
    }

    pub fn is_auto(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.is_auto)
    }

    /// Trimmed message text; empty content counts as absent.
    pub fn text(&self) -> Option<&str> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Participant {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Chat {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(rename = "unreadMessageCount", default)]
    pub unread_message_count: u32,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(rename = "lastMessage", default)]
    pub last_message: Option<ChatMessage>,
}

impl Chat {
    /// Display name of the conversation partner: first participant that is
    /// not `self_id`, falling back to the first participant at all.
    pub fn other_participant(&self, self_id: Option<&str>) -> &str {
        let other = self
            .participants
            .iter()
            .filter(|p| match (p.id.as_deref(), self_id) {
                (Some(pid), Some(me)) => pid != me,
                _ => true,
            })
            .find_map(|p| p.username.as_deref().filter(|u| !u.is_empty()));
        other
            .or_else(|| self.participants.first().and_then(|p| p.username.as_deref()))
            .filter(|u| !u.is_empty())
            .unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatPage {
    #[serde(default)]
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub user: Option<SessionUser>,
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

/// Order lifecycle status. Only the three named states carry semantics;
/// anything else is opaque and round-trips through the ledger unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Created,
    Completed,
    Refund,
    Other(String),
}

impl OrderStatus {
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "CREATED" => OrderStatus::Created,
            "COMPLETED" => OrderStatus::Completed,
            "REFUND" => OrderStatus::Refund,
            other => OrderStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Refund => "REFUND",
            OrderStatus::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn de_opt_status<'de, D>(deserializer: D) -> Result<Option<OrderStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(OrderStatus::from_raw))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderUser {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Named {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OfferDetails {
    #[serde(default)]
    pub game: Option<Named>,
    #[serde(default)]
    pub category: Option<Named>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Order {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_status")]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub user: Option<OrderUser>,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(rename = "totalPrice", default)]
    pub total_price: Option<i64>,
    #[serde(rename = "basePrice", default)]
    pub base_price: Option<i64>,
    #[serde(rename = "offerDetails", default)]
    pub offer_details: Option<OfferDetails>,
}

impl Order {
    /// Price in minor units; `totalPrice` wins over `basePrice`.
    pub fn price_minor(&self) -> i64 {
        self.total_price.or(self.base_price).unwrap_or(0)
    }

    pub fn buyer_label(&self) -> String {
        match &self.user {
            Some(u) => u
                .username
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| u.id.clone())
                .unwrap_or_else(|| "-".to_string()),
            None => "-".to_string(),
        }
    }

    pub fn game_name(&self) -> &str {
        self.offer_details
            .as_ref()
            .and_then(|o| o.game.as_ref())
            .and_then(|g| g.name.as_deref())
            .unwrap_or("-")
    }

    pub fn category_name(&self) -> &str {
        self.offer_details
            .as_ref()
            .and_then(|o| o.category.as_ref())
            .and_then(|c| c.name.as_deref())
            .unwrap_or("-")
    }
}

// ─────────────────────────────────────────────────────────
// Listings / offers
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlugRef {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Offer {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub game: Option<SlugRef>,
    #[serde(default)]
    pub category: Option<SlugRef>,
    #[serde(rename = "gameId", default)]
    pub game_id: Option<i64>,
    #[serde(rename = "categoryId", default)]
    pub category_id: Option<i64>,
}

impl Offer {
    /// Category id, preferring the nested object over the flat field.
    pub fn resolved_category_id(&self) -> Option<i64> {
        self.category
            .as_ref()
            .and_then(|c| c.id)
            .or(self.category_id)
    }

    /// Game id, preferring the flat field over the nested object.
    pub fn resolved_game_id(&self) -> Option<i64> {
        self.game_id.or_else(|| self.game.as_ref().and_then(|g| g.id))
    }

    pub fn slug_pair(&self) -> Option<(&str, &str)> {
        let game = self.game.as_ref()?.slug.as_deref()?;
        let category = self.category.as_ref()?.slug.as_deref()?;
        (!game.is_empty() && !category.is_empty()).then_some((game, category))
    }
}

/// Per-category result of a batched bump request, attributed by the caller
/// back to the category ids it covered.
#[derive(Debug, Clone, Default)]
pub struct BumpOutcome {
    pub category_ids: Vec<i64>,
    pub success: bool,
    pub error: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Broadcast digest payload
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DigestButton {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Operator broadcast payload carried inside the versioned document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DigestPayload {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "ph", default)]
    pub photo: Option<String>,
    #[serde(rename = "kb", default)]
    pub keyboard: Option<Vec<Vec<DigestButton>>>,
    #[serde(default)]
    pub pin: bool,
}
