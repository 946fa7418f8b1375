//! sellwatch — storefront account watcher.
//!
//! Bootstrap: probe the session, resolve inventory, run one synchronous
//! chat/order pass, then spawn the four poll loops. Everything the loops
//! share is built here and passed in explicitly (no globals), and a loop
//! that ever exits is logged by name instead of vanishing.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use sellwatch::broadcast::GistFeed;
use sellwatch::client::{MarketApi, StorefrontClient};
use sellwatch::config::{CredentialSource, Settings};
use sellwatch::inventory;
use sellwatch::ledger::{Ledger, NotifyKind};
use sellwatch::notify::{render_auth_status, Notify, TelegramNotifier};
use sellwatch::watch::bump::BumpScheduler;
use sellwatch::watch::chat::ChatWatcher;
use sellwatch::watch::digest::DigestPoller;
use sellwatch::watch::orders::OrderWatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let file_appender = tracing_appender::rolling::daily("logs", "sellwatch.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let settings = Settings::from_env();
    info!(base_url = %settings.base_url, "sellwatch starting");

    let ledger = Arc::new(Ledger::open(&settings.ledger_path)?);
    let client = Arc::new(StorefrontClient::new(
        &settings.base_url,
        settings.http_timeout,
    )?);
    let notifier = Arc::new(TelegramNotifier::new(
        settings.bot_token.clone(),
        settings.telegram_api_base.clone(),
        settings.http_timeout,
    )?);
    let creds_source = CredentialSource::new(settings.credentials_path.clone());

    // ── Bootstrap: auth probe ──
    let Some(creds) = creds_source.current() else {
        anyhow::bail!("no session cookie configured (SESSION_COOKIE or credentials file)");
    };
    let auth = client.fetch_auth(&creds).await?;
    if !auth.authorized || auth.user.is_none() {
        warn!("session is not authorized; notify and exit");
        let message = render_auth_status(false, None, &settings.base_url);
        match ledger.recipients(NotifyKind::Auth) {
            Ok(recipients) => {
                if let Err(err) = notifier.notify(&recipients, &message).await {
                    warn!(error = %err, "auth notification failed");
                }
            }
            Err(err) => error!(error = %err, "recipient lookup failed"),
        }
        return Ok(());
    }
    let user = auth.user.clone().unwrap_or_default();
    info!(
        user = user.username.as_deref().unwrap_or("-"),
        id = user.id.as_deref().unwrap_or("-"),
        "session authorized"
    );
    let message = render_auth_status(true, Some(&user), &settings.base_url);
    match ledger.recipients(NotifyKind::Auth) {
        Ok(recipients) => {
            if let Err(err) = notifier.notify(&recipients, &message).await {
                warn!(error = %err, "auth notification failed");
            }
        }
        Err(err) => error!(error = %err, "recipient lookup failed"),
    }

    // ── Bootstrap: initial inventory resolve (log-only; the scheduler
    //    rebuilds its own map every cycle) ──
    let boot_creds = creds.clone().with_sid(auth.sid.clone());
    if let Some(user_id) = user.id.as_deref() {
        match inventory::resolve(&*client, &boot_creds, &settings.base_url, user_id).await {
            Ok(map) => info!(
                listings = map.listings.len(),
                games = map.game_to_categories.len(),
                "inventory resolved"
            ),
            Err(err) => warn!(error = %err, "initial inventory resolve failed"),
        }
    }

    // ── Bootstrap: one synchronous pass so cursors are adopted before the
    //    loops start racing ──
    let mut chat_watcher = ChatWatcher::new(
        client.clone(),
        ledger.clone(),
        notifier.clone(),
        creds_source.clone(),
        &settings,
        user.id.clone(),
    );
    if let Err(err) = chat_watcher.poll_once(&creds).await {
        warn!(error = %err, "initial chat pass failed");
    }
    let order_watcher = OrderWatcher::new(
        client.clone(),
        ledger.clone(),
        notifier.clone(),
        creds_source.clone(),
        &settings,
    );
    if let Err(err) = order_watcher.poll_once(&creds).await {
        warn!(error = %err, "initial order pass failed");
    }

    let bump_scheduler = BumpScheduler::new(
        client.clone(),
        ledger.clone(),
        notifier.clone(),
        creds_source.clone(),
        &settings,
    );
    let feed = Arc::new(GistFeed::new(
        &settings.digest_doc_id,
        &settings.digest_file,
        settings.http_timeout,
    )?);
    let digest_poller = DigestPoller::new(
        feed,
        ledger.clone(),
        notifier.clone(),
        settings.digest_poll_interval,
        settings.digest_author_id,
    );

    // ── Steady state: four independent loops, owned by this task group ──
    let mut loops: JoinSet<&'static str> = JoinSet::new();
    loops.spawn(async move {
        chat_watcher.run().await;
        "chat"
    });
    loops.spawn(async move {
        order_watcher.run().await;
        "orders"
    });
    loops.spawn(async move {
        bump_scheduler.run().await;
        "bump"
    });
    loops.spawn(async move {
        digest_poller.run().await;
        "digest"
    });
    info!("watcher loops started");

    // The loops never return; anything arriving here is a defect worth a
    // loud log, not a silent disappearance.
    while let Some(result) = loops.join_next().await {
        match result {
            Ok(name) => error!(watcher = name, "watcher loop exited unexpectedly"),
            Err(err) => error!(error = %err, "watcher task failed"),
        }
    }
    Ok(())
}
