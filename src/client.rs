//! Storefront HTTP client.
//!
//! Thin reqwest wrapper over the session-cookie-authenticated web API.
//! Every failure mode here is transient by classification: the caller skips
//! the affected entity for the current cycle and retries on the next poll.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SessionCredentials;
use crate::types::{
    AuthSnapshot, BumpOutcome, ChatMessage, ChatPage, Listing, Offer, Order,
};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

/// Upstream fetch failure. All variants are skip-this-cycle class: the next
/// poll retries from scratch, so none of them escalate.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("schema: {0}")]
    Schema(&'static str),
}

/// The upstream surface the watchers poll. Split out as a trait so watcher
/// logic can run against fixtures.
#[async_trait]
pub trait MarketApi: Send + Sync {
    async fn fetch_auth(&self, creds: &SessionCredentials) -> Result<AuthSnapshot, UpstreamError>;

    async fn fetch_chats(&self, creds: &SessionCredentials) -> Result<ChatPage, UpstreamError>;

    async fn fetch_chat_messages(
        &self,
        creds: &SessionCredentials,
        chat_id: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, UpstreamError>;

    async fn fetch_orders(&self, creds: &SessionCredentials) -> Result<Vec<Order>, UpstreamError>;

    async fn fetch_listings(
        &self,
        creds: &SessionCredentials,
        user_id: &str,
    ) -> Result<Vec<Listing>, UpstreamError>;

    async fn fetch_offer_detail(
        &self,
        creds: &SessionCredentials,
        offer_id: i64,
    ) -> Result<Offer, UpstreamError>;

    /// One batched visibility bump covering every category of a game.
    async fn bump_categories(
        &self,
        creds: &SessionCredentials,
        game_id: i64,
        category_ids: &[i64],
        referer: Option<&str>,
    ) -> Result<BumpOutcome, UpstreamError>;
}

// ─────────────────────────────────────────────────────────
// Response envelopes
// ─────────────────────────────────────────────────────────

/// The web API wraps page-backed responses in a `pageProps` envelope.
#[derive(Debug, Deserialize)]
struct PageEnvelope<T> {
    #[serde(rename = "pageProps", default)]
    page_props: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct OrdersPage {
    #[serde(default)]
    orders: Vec<Order>,
}

#[derive(Debug, Default, Deserialize)]
struct OfferDetailPage {
    #[serde(default)]
    offer: Option<Offer>,
}

#[derive(Debug, Deserialize)]
struct BumpResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct BumpRequest<'a> {
    #[serde(rename = "gameId")]
    game_id: i64,
    #[serde(rename = "categoryIds")]
    category_ids: &'a [i64],
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct StorefrontClient {
    http: reqwest::Client,
    base_url: String,
}

impl StorefrontClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn cookie_header(creds: &SessionCredentials) -> String {
        match &creds.sid {
            Some(sid) => format!("session={}; sid={}", creds.session.expose_secret(), sid),
            None => format!("session={}", creds.session.expose_secret()),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        creds: &SessionCredentials,
        path: &str,
        referer: Option<&str>,
    ) -> Result<T, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .get(&url)
            .header(reqwest::header::COOKIE, Self::cookie_header(creds))
            .header(reqwest::header::ORIGIN, &self.base_url);
        if let Some(referer) = referer {
            req = req.header(reqwest::header::REFERER, referer);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Status(resp.status()));
        }
        Ok(resp.json::<T>().await?)
    }

    fn unwrap_page<T>(envelope: PageEnvelope<T>) -> Result<T, UpstreamError> {
        envelope
            .page_props
            .ok_or(UpstreamError::Schema("pageProps missing"))
    }
}

#[async_trait]
impl MarketApi for StorefrontClient {
    async fn fetch_auth(&self, creds: &SessionCredentials) -> Result<AuthSnapshot, UpstreamError> {
        self.get_json(creds, "/api/session", None).await
    }

    async fn fetch_chats(&self, creds: &SessionCredentials) -> Result<ChatPage, UpstreamError> {
        let envelope: PageEnvelope<ChatPage> = self.get_json(creds, "/api/chats", None).await?;
        Self::unwrap_page(envelope)
    }

    async fn fetch_chat_messages(
        &self,
        creds: &SessionCredentials,
        chat_id: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, UpstreamError> {
        let path = format!("/api/chats/{chat_id}/messages?limit={limit}");
        let referer = format!("{}/chat/{chat_id}", self.base_url);
        self.get_json(creds, &path, Some(&referer)).await
    }

    async fn fetch_orders(&self, creds: &SessionCredentials) -> Result<Vec<Order>, UpstreamError> {
        let envelope: PageEnvelope<OrdersPage> =
            self.get_json(creds, "/api/orders/sells", None).await?;
        Ok(Self::unwrap_page(envelope)?.orders)
    }

    async fn fetch_listings(
        &self,
        creds: &SessionCredentials,
        user_id: &str,
    ) -> Result<Vec<Listing>, UpstreamError> {
        let path = format!("/api/users/{user_id}/offers");
        self.get_json(creds, &path, None).await
    }

    async fn fetch_offer_detail(
        &self,
        creds: &SessionCredentials,
        offer_id: i64,
    ) -> Result<Offer, UpstreamError> {
        let path = format!("/api/offers/{offer_id}");
        let envelope: PageEnvelope<OfferDetailPage> = self.get_json(creds, &path, None).await?;
        Self::unwrap_page(envelope)?
            .offer
            .ok_or(UpstreamError::Schema("offer missing"))
    }

    async fn bump_categories(
        &self,
        creds: &SessionCredentials,
        game_id: i64,
        category_ids: &[i64],
        referer: Option<&str>,
    ) -> Result<BumpOutcome, UpstreamError> {
        let url = format!("{}/api/offers/bump", self.base_url);
        let mut req = self
            .http
            .post(&url)
            .header(reqwest::header::COOKIE, Self::cookie_header(creds))
            .header(reqwest::header::ORIGIN, &self.base_url)
            .json(&BumpRequest {
                game_id,
                category_ids,
            });
        if let Some(referer) = referer {
            req = req.header(reqwest::header::REFERER, referer);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Status(resp.status()));
        }
        let body: BumpResponse = resp.json().await?;
        Ok(BumpOutcome {
            category_ids: category_ids.to_vec(),
            success: body.success,
            error: body.error,
        })
    }
}
