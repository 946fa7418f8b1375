//! Broadcast digest poller.
//!
//! Two independent streams off the operator's versioned document, each with
//! its own dedup key space in the ledger: the descriptor payload itself
//! (keyed by its version tag, else a content hash + the host's revision
//! timestamp) and the trusted author's comment feed (keyed by comment id,
//! else a body hash). Dedup writes are best-effort: the key is recomputable,
//! so a lost write costs at most one duplicate broadcast.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastFeed, DescriptorFetch};
use crate::ledger::{Ledger, NotifyKind};
use crate::notify::{render_digest, Notify};
use crate::types::DigestPayload;

/// Upper bound on comments considered per cycle.
const MAX_COMMENTS: usize = 50;

pub struct DigestPoller<F, N> {
    feed: Arc<F>,
    ledger: Arc<Ledger>,
    notifier: Arc<N>,
    interval: Duration,
    trusted_author: i64,
}

impl<F: BroadcastFeed, N: Notify> DigestPoller<F, N> {
    pub fn new(
        feed: Arc<F>,
        ledger: Arc<Ledger>,
        notifier: Arc<N>,
        interval: Duration,
        trusted_author: i64,
    ) -> Self {
        Self {
            feed,
            ledger,
            notifier,
            interval,
            trusted_author,
        }
    }

    pub async fn run(self) {
        info!(interval = ?self.interval, "digest poller started");
        loop {
            if let Err(err) = self.poll_descriptor().await {
                warn!(error = %err, "descriptor poll failed");
            }
            if let Err(err) = self.poll_comments().await {
                warn!(error = %err, "comment poll failed");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn poll_descriptor(&self) -> anyhow::Result<u32> {
        let Some(doc) = self.feed.fetch_descriptor().await? else {
            return Ok(0);
        };
        let payload: DigestPayload = match serde_json::from_str(&doc.content) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "descriptor payload is not valid JSON; skipping");
                return Ok(0);
            }
        };
        let key = descriptor_key(&payload, &doc);
        if self.seen(&key) {
            return Ok(0);
        }
        let message = render_digest(&payload);
        if message.text.is_empty() && message.photo_url.is_none() {
            return Ok(0); // nothing renderable
        }
        let recipients = self.ledger.recipients(NotifyKind::Digest)?;
        self.notifier.notify(&recipients, &message).await?;
        self.remember(&key);
        Ok(1)
    }

    async fn poll_comments(&self) -> anyhow::Result<u32> {
        let mut comments = self.feed.fetch_comments().await?;
        comments.sort_by_key(|c| c.id.unwrap_or(0));

        let mut sent = 0;
        for comment in comments
            .into_iter()
            .filter(|c| c.owner && c.author_id == Some(self.trusted_author))
            .take(MAX_COMMENTS)
        {
            let Some(body) = comment
                .body
                .as_deref()
                .map(str::trim)
                .filter(|b| !b.is_empty())
            else {
                continue;
            };
            let key = match comment.id {
                Some(id) => format!("n:{id}"),
                None => format!("n:{}", sha256_hex(body)),
            };
            if self.seen(&key) {
                continue;
            }
            let payload = DigestPayload {
                text: Some(body.to_string()),
                ..Default::default()
            };
            let message = render_digest(&payload);
            self.notifier
                .notify(&self.ledger.recipients(NotifyKind::Digest)?, &message)
                .await?;
            self.remember(&key);
            sent += 1;
        }
        Ok(sent)
    }

    /// Best-effort dedup read; an unreadable ledger degrades to re-sending.
    fn seen(&self, key: &str) -> bool {
        self.ledger.is_digest_sent(key).unwrap_or_else(|err| {
            warn!(key, error = %err, "digest dedup read failed");
            false
        })
    }

    fn remember(&self, key: &str) {
        if let Err(err) = self.ledger.mark_digest_sent(key) {
            warn!(key, error = %err, "digest dedup write failed; duplicate possible");
        } else {
            debug!(key, "digest delivered");
        }
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Dedup key for the descriptor: prefer the explicit version tag, else a
/// content hash combined with the host's own revision timestamp.
fn descriptor_key(payload: &DigestPayload, doc: &DescriptorFetch) -> String {
    if let Some(tag) = payload.tag.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        return format!("d:{tag}");
    }
    let digest = sha256_hex(&doc.content);
    let hash = &digest[..16];
    match doc.updated_at.as_deref().filter(|u| !u.is_empty()) {
        Some(updated) => format!("d:{updated}:{hash}"),
        None => format!("d:{hash}"),
    }
}
