//! Bump scheduler.
//!
//! On a fixed period: re-probe the session, rebuild the inventory map from
//! scratch, then issue one batched bump request per game covering all of its
//! category ids. Successes are attributed back to individual listings and
//! announced per listing. An empty map is a quiet cycle, not an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::client::MarketApi;
use crate::config::{CredentialSource, SessionCredentials, Settings};
use crate::inventory;
use crate::ledger::{Ledger, NotifyKind};
use crate::notify::{render_bump_success, Notify};

/// Retry delay when the session turns out to be unauthorized mid-flight;
/// much shorter than the bump period so a rotated cookie is picked up fast.
const AUTH_RETRY: Duration = Duration::from_secs(60);

pub struct BumpScheduler<A, N> {
    api: Arc<A>,
    ledger: Arc<Ledger>,
    notifier: Arc<N>,
    creds: CredentialSource,
    interval: Duration,
    base_url: String,
}

impl<A: MarketApi, N: Notify> BumpScheduler<A, N> {
    pub fn new(
        api: Arc<A>,
        ledger: Arc<Ledger>,
        notifier: Arc<N>,
        creds: CredentialSource,
        settings: &Settings,
    ) -> Self {
        Self {
            api,
            ledger,
            notifier,
            creds,
            interval: settings.bump_interval,
            base_url: settings.base_url.clone(),
        }
    }

    pub async fn run(self) {
        info!(interval = ?self.interval, "bump scheduler started");
        loop {
            let delay = match self.creds.current() {
                Some(creds) => match self.cycle(&creds).await {
                    Ok(Some(announced)) => {
                        if announced > 0 {
                            debug!(announced, "bump cycle complete");
                        }
                        self.interval
                    }
                    Ok(None) => {
                        warn!("bump cycle skipped: session not authorized");
                        AUTH_RETRY
                    }
                    Err(err) => {
                        warn!(error = %err, "bump cycle failed");
                        self.interval
                    }
                },
                None => {
                    warn!("bump cycle skipped: no session cookie configured");
                    self.interval
                }
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// One bump cycle. `Ok(None)` means the session was not authorized.
    pub async fn cycle(&self, creds: &SessionCredentials) -> anyhow::Result<Option<u32>> {
        let auth = self.api.fetch_auth(creds).await?;
        if !auth.authorized {
            return Ok(None);
        }
        let Some(user_id) = auth.acting_user_id().map(str::to_string) else {
            return Ok(None);
        };
        let creds = creds.clone().with_sid(auth.sid);

        let map = inventory::resolve(&*self.api, &creds, &self.base_url, &user_id).await?;
        if map.is_empty() {
            debug!("no bumpable inventory this cycle");
            return Ok(Some(0));
        }

        // One batched request per game, all games in flight together.
        let batches: Vec<(i64, Vec<i64>)> = map
            .game_to_categories
            .iter()
            .filter(|(_, categories)| !categories.is_empty())
            .map(|(game, categories)| (*game, categories.iter().copied().collect()))
            .collect();
        let results = join_all(batches.iter().map(|(game, categories)| {
            self.api
                .bump_categories(&creds, *game, categories, map.referer.as_deref())
        }))
        .await;

        let mut success_by_category: HashMap<i64, bool> = HashMap::new();
        for ((game, _), result) in batches.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    if let Some(error) = &outcome.error {
                        debug!(game, error = %error, "bump declined");
                    }
                    for category in outcome.category_ids {
                        success_by_category.insert(category, outcome.success);
                    }
                }
                Err(err) => warn!(game, error = %err, "bump request failed"),
            }
        }

        let recipients = self.ledger.recipients(NotifyKind::Bump)?;
        let mut announced = 0;
        for listing in &map.listings {
            let bumped = listing
                .category_id
                .is_some_and(|category| success_by_category.get(&category) == Some(&true));
            if !bumped {
                continue;
            }
            let message = render_bump_success(&listing.into());
            match self.notifier.notify(&recipients, &message).await {
                Ok(()) => {
                    announced += 1;
                    info!(listing = listing.id, "listing bumped");
                }
                Err(err) => warn!(listing = listing.id, error = %err, "bump notify failed"),
            }
        }
        Ok(Some(announced))
    }
}
