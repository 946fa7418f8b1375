//! Inventory resolution for the bump scheduler.
//!
//! Listings change over time, so the game → categories map is rebuilt from
//! scratch every cycle: list the account's offers, fetch each offer's detail
//! for its game/category ids, and derive a display referer URL from the
//! first game/category slug pair seen.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures::future::join_all;
use tracing::debug;

use crate::client::{MarketApi, UpstreamError};
use crate::config::SessionCredentials;
use crate::types::Listing;

/// A listing enriched with the ids its bump attribution needs.
#[derive(Debug, Clone)]
pub struct InventoryListing {
    pub id: i64,
    pub title: Option<String>,
    pub url: Option<String>,
    pub category_id: Option<i64>,
    pub game_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct InventoryMap {
    pub listings: Vec<InventoryListing>,
    /// game id → category ids covered by at least one listing. BTree keeps
    /// bump request batches deterministic.
    pub game_to_categories: BTreeMap<i64, BTreeSet<i64>>,
    /// Display referer derived from the first resolved slug pair.
    pub referer: Option<String>,
}

impl InventoryMap {
    pub fn is_empty(&self) -> bool {
        self.game_to_categories.is_empty()
    }
}

/// Resolve the account's current inventory. A failed detail fetch skips that
/// listing for this cycle; only the listing index fetch itself can fail the
/// whole resolve.
pub async fn resolve<A: MarketApi>(
    api: &A,
    creds: &SessionCredentials,
    base_url: &str,
    user_id: &str,
) -> Result<InventoryMap, UpstreamError> {
    let listings = api.fetch_listings(creds, user_id).await?;
    let ids: Vec<i64> = listings.iter().filter_map(|l| l.id).collect();

    let details = join_all(
        ids.iter()
            .map(|&offer_id| api.fetch_offer_detail(creds, offer_id)),
    )
    .await;

    let mut category_by_offer: HashMap<i64, i64> = HashMap::new();
    let mut game_by_offer: HashMap<i64, i64> = HashMap::new();
    let mut referer: Option<String> = None;
    for (offer_id, detail) in ids.iter().zip(details) {
        let offer = match detail {
            Ok(offer) => offer,
            Err(err) => {
                debug!(offer = offer_id, error = %err, "offer detail fetch failed; skipping");
                continue;
            }
        };
        if let Some(category_id) = offer.resolved_category_id() {
            category_by_offer.insert(*offer_id, category_id);
        }
        if let Some(game_id) = offer.resolved_game_id() {
            game_by_offer.insert(*offer_id, game_id);
        }
        if referer.is_none() {
            if let Some((game_slug, category_slug)) = offer.slug_pair() {
                referer = Some(format!("{base_url}/{game_slug}/{category_slug}"));
            }
        }
    }

    let mut map = InventoryMap {
        referer,
        ..Default::default()
    };
    for listing in &listings {
        let Some(id) = listing.id else { continue };
        let category_id = category_by_offer.get(&id).copied();
        let game_id = game_by_offer.get(&id).copied();
        if let (Some(game), Some(category)) = (game_id, category_id) {
            map.game_to_categories
                .entry(game)
                .or_default()
                .insert(category);
        }
        map.listings.push(InventoryListing {
            id,
            title: listing.title.clone(),
            url: listing.url.clone(),
            category_id,
            game_id,
        });
    }
    Ok(map)
}

// Keeps the raw Listing type available to render helpers without re-fetching.
impl From<&InventoryListing> for Listing {
    fn from(listing: &InventoryListing) -> Self {
        Listing {
            id: Some(listing.id),
            title: listing.title.clone(),
            url: listing.url.clone(),
        }
    }
}
