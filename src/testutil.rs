//! Shared fixtures for watcher tests: an in-memory upstream and a recording
//! notifier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::SecretString;

use crate::client::{MarketApi, UpstreamError};
use crate::config::SessionCredentials;
use crate::ledger::Ledger;
use crate::notify::{Notify, RenderedMessage};
use crate::types::{
    AuthSnapshot, BumpOutcome, ChatMessage, ChatPage, Listing, Offer, Order,
};

pub fn test_creds() -> SessionCredentials {
    SessionCredentials::new(SecretString::from("test-session".to_string()))
}

/// In-memory ledger with a single authorized subscriber (id 1).
pub fn ledger_with_subscriber() -> Arc<Ledger> {
    let ledger = Ledger::open_in_memory().unwrap();
    ledger.upsert_subscriber(1).unwrap();
    ledger.set_authorized(1, true).unwrap();
    Arc::new(ledger)
}

#[derive(Default)]
pub struct FakeMarket {
    pub auth: Mutex<AuthSnapshot>,
    pub chats: Mutex<ChatPage>,
    /// chat id → message window, newest first.
    pub messages: Mutex<HashMap<String, Vec<ChatMessage>>>,
    /// When set, every message-window fetch fails.
    pub fail_messages: AtomicBool,
    pub message_fetches: AtomicUsize,
    pub orders: Mutex<Vec<Order>>,
    pub listings: Mutex<Vec<Listing>>,
    pub details: Mutex<HashMap<i64, Offer>>,
    /// game id → canned bump outcome; unset games succeed wholesale.
    pub bump_results: Mutex<HashMap<i64, BumpOutcome>>,
    /// Recorded bump requests: (game id, category ids as sent).
    pub bump_calls: Mutex<Vec<(i64, Vec<i64>)>>,
}

#[async_trait]
impl MarketApi for FakeMarket {
    async fn fetch_auth(&self, _creds: &SessionCredentials) -> Result<AuthSnapshot, UpstreamError> {
        Ok(self.auth.lock().unwrap().clone())
    }

    async fn fetch_chats(&self, _creds: &SessionCredentials) -> Result<ChatPage, UpstreamError> {
        Ok(self.chats.lock().unwrap().clone())
    }

    async fn fetch_chat_messages(
        &self,
        _creds: &SessionCredentials,
        chat_id: &str,
        _limit: u32,
    ) -> Result<Vec<ChatMessage>, UpstreamError> {
        self.message_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(UpstreamError::Schema("window unavailable"));
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_orders(&self, _creds: &SessionCredentials) -> Result<Vec<Order>, UpstreamError> {
        Ok(self.orders.lock().unwrap().clone())
    }

    async fn fetch_listings(
        &self,
        _creds: &SessionCredentials,
        _user_id: &str,
    ) -> Result<Vec<Listing>, UpstreamError> {
        Ok(self.listings.lock().unwrap().clone())
    }

    async fn fetch_offer_detail(
        &self,
        _creds: &SessionCredentials,
        offer_id: i64,
    ) -> Result<Offer, UpstreamError> {
        self.details
            .lock()
            .unwrap()
            .get(&offer_id)
            .cloned()
            .ok_or(UpstreamError::Schema("offer missing"))
    }

    async fn bump_categories(
        &self,
        _creds: &SessionCredentials,
        game_id: i64,
        category_ids: &[i64],
        _referer: Option<&str>,
    ) -> Result<BumpOutcome, UpstreamError> {
        self.bump_calls
            .lock()
            .unwrap()
            .push((game_id, category_ids.to_vec()));
        let canned = self.bump_results.lock().unwrap().get(&game_id).cloned();
        Ok(canned.unwrap_or(BumpOutcome {
            category_ids: category_ids.to_vec(),
            success: true,
            error: None,
        }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Vec<i64>, RenderedMessage)>>,
    /// When set, every dispatch fails.
    pub fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.text.clone())
            .collect()
    }
}

#[async_trait]
impl Notify for RecordingNotifier {
    async fn notify(&self, recipients: &[i64], message: &RenderedMessage) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("notifier down");
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipients.to_vec(), message.clone()));
        Ok(())
    }
}

// ── Entity builders ──

pub fn chat_message(id: &str, author: &str, content: &str) -> ChatMessage {
    ChatMessage {
        id: Some(id.to_string()),
        author_id: Some(author.to_string()),
        content: Some(content.to_string()),
        ..Default::default()
    }
}

pub fn auto_message(id: &str, author: &str, content: &str) -> ChatMessage {
    let mut msg = chat_message(id, author, content);
    msg.metadata = Some(crate::types::MessageMeta { is_auto: true });
    msg
}

pub fn order(id: &str, status: &str) -> Order {
    Order {
        id: Some(id.to_string()),
        status: Some(crate::types::OrderStatus::from_raw(status)),
        ..Default::default()
    }
}
