//! Chat watcher.
//!
//! Polls the chat list and, for chats with unseen traffic, a bounded recent
//! message window. The per-chat ledger cursor records the last message id
//! already notified: a chat seen for the first time adopts the current last
//! message id without notifying (no storm over pre-existing history), and
//! the cursor advances only after a successful dispatch, so a crash between
//! the two re-notifies at most the tail and never skips.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::client::{MarketApi, UpstreamError};
use crate::config::{CredentialSource, SessionCredentials, Settings};
use crate::ledger::{Ledger, NotifyKind};
use crate::notify::{render_chat_message, truncate_snippet, Notify};
use crate::types::Chat;

/// Notification body cap, matching the delivery transport's comfort zone.
const SNIPPET_MAX: usize = 500;
/// Floor for the message window when a cursor exists; unread counts lag, so
/// fetch generously and let the cursor terminate the scan.
const WINDOW_FLOOR: u32 = 50;

pub struct ChatWatcher<A, N> {
    api: Arc<A>,
    ledger: Arc<Ledger>,
    notifier: Arc<N>,
    creds: CredentialSource,
    interval: Duration,
    base_url: String,
    /// Acting account id, refreshed from every chat list response.
    self_id: Option<String>,
}

impl<A: MarketApi, N: Notify> ChatWatcher<A, N> {
    pub fn new(
        api: Arc<A>,
        ledger: Arc<Ledger>,
        notifier: Arc<N>,
        creds: CredentialSource,
        settings: &Settings,
        self_id: Option<String>,
    ) -> Self {
        Self {
            api,
            ledger,
            notifier,
            creds,
            interval: settings.chat_poll_interval,
            base_url: settings.base_url.clone(),
            self_id,
        }
    }

    pub async fn run(mut self) {
        info!(interval = ?self.interval, "chat watcher started");
        loop {
            match self.creds.current() {
                Some(creds) => match self.poll_once(&creds).await {
                    Ok(dispatched) if dispatched > 0 => {
                        debug!(dispatched, "chat poll complete");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "chat poll failed"),
                },
                None => warn!("chat poll skipped: no session cookie configured"),
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One full pass over the chat list. Per-chat failures degrade to "skip
    /// this chat this cycle"; only the list fetch itself surfaces an error.
    pub async fn poll_once(&mut self, creds: &SessionCredentials) -> Result<u32, UpstreamError> {
        let page = self.api.fetch_chats(creds).await?;
        if let Some(id) = page.user.as_ref().and_then(|u| u.id.clone()) {
            self.self_id = Some(id);
        }
        let mut dispatched = 0;
        for chat in &page.chats {
            dispatched += self.scan_chat(creds, chat).await;
        }
        Ok(dispatched)
    }

    async fn scan_chat(&self, creds: &SessionCredentials, chat: &Chat) -> u32 {
        let Some(chat_id) = chat.id.as_deref() else {
            return 0;
        };
        let Some(last) = chat.last_message.as_ref() else {
            return 0;
        };
        let Some(last_id) = last.id.as_deref() else {
            return 0;
        };
        if last.is_auto() {
            return 0;
        }

        let stored = match self.ledger.chat_cursor(chat_id) {
            Ok(stored) => stored,
            Err(err) => {
                error!(chat = chat_id, error = %err, "ledger cursor read failed");
                return 0;
            }
        };
        let Some(stored) = stored else {
            // First sight: adopt the current head silently. Notifying here
            // would replay the chat's entire pre-existing history.
            if let Err(err) = self.ledger.set_chat_cursor(chat_id, last_id) {
                error!(chat = chat_id, error = %err, "ledger cursor adopt failed");
            }
            return 0;
        };
        if stored == last_id {
            return 0; // no unseen traffic
        }

        let username = chat.other_participant(self.self_id.as_deref()).to_string();
        let limit = chat.unread_message_count.max(WINDOW_FLOOR);

        // Summary author, possibly refined below from the window entry that
        // matches the last-message id. Best-effort: under concurrent traffic
        // from both sides this can misattribute.
        let mut last_author: Option<String> = last.sender().map(str::to_string);
        let mut to_notify: Vec<(String, String)> = Vec::new();

        match self.api.fetch_chat_messages(creds, chat_id, limit).await {
            Ok(messages) => {
                // Newest-to-oldest scan, terminated by the stored cursor.
                let mut fresh: Vec<(String, String)> = Vec::new();
                for msg in &messages {
                    let Some(mid) = msg.id.as_deref() else {
                        continue;
                    };
                    if mid == stored {
                        break;
                    }
                    if msg.is_auto() {
                        continue;
                    }
                    let author = msg.sender();
                    if mid == last_id && author.is_some() {
                        last_author = author.map(str::to_string);
                    }
                    if let (Some(author), Some(me)) = (author, self.self_id.as_deref()) {
                        if author == me {
                            continue; // self-echo, e.g. a manual reply
                        }
                    }
                    let Some(text) = msg.text() else {
                        continue;
                    };
                    fresh.push((mid.to_string(), text.to_string()));
                }
                fresh.reverse(); // chronological dispatch order
                to_notify = fresh;
            }
            Err(err) => {
                warn!(
                    chat = chat_id,
                    error = %err,
                    "message window fetch failed; falling back to chat summary"
                );
            }
        }

        // Fallback: the window gave us nothing but the head moved. Notify
        // once from the summary, unless the head is our own message.
        if to_notify.is_empty() {
            let from_self = match (last_author.as_deref(), self.self_id.as_deref()) {
                (Some(author), Some(me)) => author == me,
                _ => false,
            };
            if !from_self {
                if let Some(text) = last.text() {
                    to_notify.push((last_id.to_string(), text.to_string()));
                }
            }
        }

        let recipients = match self.ledger.recipients(NotifyKind::Chat) {
            Ok(recipients) => recipients,
            Err(err) => {
                error!(chat = chat_id, error = %err, "recipient lookup failed");
                return 0;
            }
        };

        let mut dispatched = 0;
        for (mid, text) in to_notify {
            if mid == stored {
                continue;
            }
            let snippet = truncate_snippet(&text, SNIPPET_MAX);
            if snippet.is_empty() {
                continue;
            }
            let message = render_chat_message(&username, &snippet, chat_id, &self.base_url);
            match self.notifier.notify(&recipients, &message).await {
                Ok(()) => {
                    dispatched += 1;
                    // Cursor reflects "notified up to". A failed write here
                    // must be loud: it means duplicates next cycle.
                    if let Err(err) = self.ledger.set_chat_cursor(chat_id, &mid) {
                        error!(
                            chat = chat_id,
                            message = %mid,
                            error = %err,
                            "cursor advance failed; expect a duplicate notification"
                        );
                    }
                }
                Err(err) => {
                    warn!(chat = chat_id, message = %mid, error = %err, "chat notify failed");
                    // Leave the cursor behind this message so the next poll
                    // retries it (and everything after it).
                    break;
                }
            }
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        auto_message, chat_message, ledger_with_subscriber, test_creds, FakeMarket,
        RecordingNotifier,
    };
    use crate::types::{ChatPage, SessionUser};
    use std::sync::atomic::Ordering;

    const ME: &str = "u1";
    const BUYER: &str = "u2";

    fn chat_with_last(id: &str, last: crate::types::ChatMessage, unread: u32) -> Chat {
        Chat {
            id: Some(id.to_string()),
            unread_message_count: unread,
            participants: vec![
                crate::types::Participant {
                    id: Some(ME.to_string()),
                    username: Some("seller".to_string()),
                },
                crate::types::Participant {
                    id: Some(BUYER.to_string()),
                    username: Some("buyer".to_string()),
                },
            ],
            last_message: Some(last),
        }
    }

    fn watcher(
        api: Arc<FakeMarket>,
        ledger: Arc<Ledger>,
        notifier: Arc<RecordingNotifier>,
    ) -> ChatWatcher<FakeMarket, RecordingNotifier> {
        ChatWatcher::new(
            api,
            ledger,
            notifier,
            CredentialSource::new(None),
            &Settings::default(),
            Some(ME.to_string()),
        )
    }

    #[tokio::test]
    async fn first_sight_adopts_cursor_without_notifying() {
        let api = Arc::new(FakeMarket::default());
        api.chats.lock().unwrap().chats =
            vec![chat_with_last("c1", chat_message("m8", BUYER, "hello"), 3)];
        let ledger = ledger_with_subscriber();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut w = watcher(api.clone(), ledger.clone(), notifier.clone());

        let dispatched = w.poll_once(&test_creds()).await.unwrap();

        assert_eq!(dispatched, 0);
        assert!(notifier.sent.lock().unwrap().is_empty());
        assert_eq!(ledger.chat_cursor("c1").unwrap(), Some("m8".to_string()));
        // no window fetch on first sight
        assert_eq!(api.message_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scans_window_in_chronological_order_excluding_self() {
        let api = Arc::new(FakeMarket::default());
        api.chats.lock().unwrap().chats =
            vec![chat_with_last("c1", chat_message("m8", BUYER, "newest"), 2)];
        api.messages.lock().unwrap().insert(
            "c1".to_string(),
            vec![
                chat_message("m8", BUYER, "newest"),
                chat_message("m7", BUYER, "older"),
                chat_message("m6", ME, "my reply"),
                chat_message("m5", BUYER, "already notified"),
            ],
        );
        let ledger = ledger_with_subscriber();
        ledger.set_chat_cursor("c1", "m5").unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut w = watcher(api, ledger.clone(), notifier.clone());

        let dispatched = w.poll_once(&test_creds()).await.unwrap();

        assert_eq!(dispatched, 2);
        let texts = notifier.texts();
        assert!(texts[0].contains("older"));
        assert!(texts[1].contains("newest"));
        assert_eq!(ledger.chat_cursor("c1").unwrap(), Some("m8".to_string()));
    }

    #[tokio::test]
    async fn second_poll_with_no_new_messages_is_silent() {
        let api = Arc::new(FakeMarket::default());
        api.chats.lock().unwrap().chats =
            vec![chat_with_last("c1", chat_message("m8", BUYER, "hi"), 1)];
        api.messages
            .lock()
            .unwrap()
            .insert("c1".to_string(), vec![chat_message("m8", BUYER, "hi")]);
        let ledger = ledger_with_subscriber();
        ledger.set_chat_cursor("c1", "m5").unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut w = watcher(api, ledger.clone(), notifier.clone());

        assert_eq!(w.poll_once(&test_creds()).await.unwrap(), 1);
        assert_eq!(w.poll_once(&test_creds()).await.unwrap(), 0);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn auto_generated_head_skips_chat() {
        let api = Arc::new(FakeMarket::default());
        api.chats.lock().unwrap().chats =
            vec![chat_with_last("c1", auto_message("m9", BUYER, "system"), 1)];
        let ledger = ledger_with_subscriber();
        ledger.set_chat_cursor("c1", "m5").unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut w = watcher(api, ledger.clone(), notifier.clone());

        assert_eq!(w.poll_once(&test_creds()).await.unwrap(), 0);
        assert_eq!(ledger.chat_cursor("c1").unwrap(), Some("m5".to_string()));
    }

    #[tokio::test]
    async fn window_failure_falls_back_to_summary() {
        let api = Arc::new(FakeMarket::default());
        api.chats.lock().unwrap().chats =
            vec![chat_with_last("c1", chat_message("m8", BUYER, "ping"), 1)];
        api.fail_messages.store(true, Ordering::SeqCst);
        let ledger = ledger_with_subscriber();
        ledger.set_chat_cursor("c1", "m5").unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut w = watcher(api, ledger.clone(), notifier.clone());

        let dispatched = w.poll_once(&test_creds()).await.unwrap();

        assert_eq!(dispatched, 1);
        assert!(notifier.texts()[0].contains("ping"));
        assert_eq!(ledger.chat_cursor("c1").unwrap(), Some("m8".to_string()));
    }

    #[tokio::test]
    async fn window_failure_with_self_authored_head_stays_silent() {
        let api = Arc::new(FakeMarket::default());
        api.chats.lock().unwrap().chats =
            vec![chat_with_last("c1", chat_message("m8", ME, "my manual reply"), 0)];
        api.fail_messages.store(true, Ordering::SeqCst);
        let ledger = ledger_with_subscriber();
        ledger.set_chat_cursor("c1", "m5").unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut w = watcher(api, ledger.clone(), notifier.clone());

        assert_eq!(w.poll_once(&test_creds()).await.unwrap(), 0);
        assert!(notifier.sent.lock().unwrap().is_empty());
        assert_eq!(ledger.chat_cursor("c1").unwrap(), Some("m5".to_string()));
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_cursor_for_retry() {
        let api = Arc::new(FakeMarket::default());
        api.chats.lock().unwrap().chats =
            vec![chat_with_last("c1", chat_message("m8", BUYER, "hey"), 1)];
        api.messages
            .lock()
            .unwrap()
            .insert("c1".to_string(), vec![chat_message("m8", BUYER, "hey")]);
        let ledger = ledger_with_subscriber();
        ledger.set_chat_cursor("c1", "m5").unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        notifier.fail.store(true, Ordering::SeqCst);
        let mut w = watcher(api, ledger.clone(), notifier.clone());

        assert_eq!(w.poll_once(&test_creds()).await.unwrap(), 0);
        assert_eq!(ledger.chat_cursor("c1").unwrap(), Some("m5".to_string()));

        // transport recovers → the same message goes out on the next poll
        notifier.fail.store(false, Ordering::SeqCst);
        assert_eq!(w.poll_once(&test_creds()).await.unwrap(), 1);
        assert_eq!(ledger.chat_cursor("c1").unwrap(), Some("m8".to_string()));
    }

    #[tokio::test]
    async fn acting_user_refreshes_from_chat_page() {
        let api = Arc::new(FakeMarket::default());
        {
            let mut page = api.chats.lock().unwrap();
            *page = ChatPage {
                chats: vec![chat_with_last("c1", chat_message("m8", "u9", "hi"), 1)],
                user: Some(SessionUser {
                    id: Some("u9".to_string()),
                    ..Default::default()
                }),
            };
        }
        api.messages
            .lock()
            .unwrap()
            .insert("c1".to_string(), vec![chat_message("m8", "u9", "hi")]);
        let ledger = ledger_with_subscriber();
        ledger.set_chat_cursor("c1", "m5").unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        // stale self id; the page response corrects it before scanning
        let mut w = watcher(api, ledger.clone(), notifier.clone());
        w.self_id = Some("stale".to_string());

        assert_eq!(w.poll_once(&test_creds()).await.unwrap(), 0);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }
}
