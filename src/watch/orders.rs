//! Order watcher.
//!
//! Two independent checks per poll over the full order list: first
//! appearance of a CREATED order (announced once, guarded by a one-way
//! ledger flag) and status transitions (first sight records silently;
//! a genuine change to COMPLETED announces once). An order that shows up
//! already COMPLETED is recorded but never retroactively announced.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::client::{MarketApi, UpstreamError};
use crate::config::{CredentialSource, SessionCredentials, Settings};
use crate::ledger::{Ledger, NotifyKind};
use crate::notify::{render_completed_order, render_new_order, Notify};
use crate::types::{Order, OrderStatus};

pub struct OrderWatcher<A, N> {
    api: Arc<A>,
    ledger: Arc<Ledger>,
    notifier: Arc<N>,
    creds: CredentialSource,
    interval: Duration,
    base_url: String,
}

impl<A: MarketApi, N: Notify> OrderWatcher<A, N> {
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
            interval: settings.orders_poll_interval,
            base_url: settings.base_url.clone(),
        }
    }

    pub async fn run(self) {
        info!(interval = ?self.interval, "order watcher started");
        loop {
            match self.creds.current() {
                Some(creds) => {
                    if let Err(err) = self.poll_once(&creds).await {
                        warn!(error = %err, "order poll failed");
                    }
                }
                None => warn!("order poll skipped: no session cookie configured"),
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    pub async fn poll_once(&self, creds: &SessionCredentials) -> Result<(), UpstreamError> {
        let orders = self.api.fetch_orders(creds).await?;
        self.check_new(&orders).await;
        self.check_transitions(&orders).await;
        Ok(())
    }

    /// New-order detection: CREATED and not yet flagged → announce, then
    /// set the flag permanently.
    async fn check_new(&self, orders: &[Order]) {
        for order in orders {
            let Some(order_id) = order.id.as_deref() else {
                continue;
            };
            if order.status != Some(OrderStatus::Created) {
                continue;
            }
            match self.ledger.is_order_notified_new(order_id) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    // Can't prove it wasn't announced already; skip rather
                    // than risk a duplicate now, retry next poll.
                    error!(order = order_id, error = %err, "ledger flag read failed");
                    continue;
                }
            }
            let recipients = match self.ledger.recipients(NotifyKind::Orders) {
                Ok(recipients) => recipients,
                Err(err) => {
                    error!(order = order_id, error = %err, "recipient lookup failed");
                    continue;
                }
            };
            let message = render_new_order(order, &self.base_url);
            match self.notifier.notify(&recipients, &message).await {
                Ok(()) => {
                    info!(
                        order = order_id,
                        buyer = %order.buyer_label(),
                        game = order.game_name(),
                        category = order.category_name(),
                        "new order"
                    );
                    if let Err(err) = self.ledger.mark_order_notified_new(order_id) {
                        error!(
                            order = order_id,
                            error = %err,
                            "flag write failed; expect a duplicate notification"
                        );
                    }
                }
                Err(err) => {
                    warn!(order = order_id, error = %err, "new-order notify failed");
                }
            }
        }
    }

    /// Status-transition detection against the last observed status.
    async fn check_transitions(&self, orders: &[Order]) {
        for order in orders {
            let Some(order_id) = order.id.as_deref() else {
                continue;
            };
            let Some(status) = order.status.as_ref() else {
                continue;
            };
            let previous = match self.ledger.order_status(order_id) {
                Ok(previous) => previous,
                Err(err) => {
                    error!(order = order_id, error = %err, "ledger status read failed");
                    continue;
                }
            };
            let Some(previous) = previous else {
                // First sight: record without announcing, whatever the
                // status. Only prospective transitions notify.
                if let Err(err) = self.ledger.set_order_status(order_id, status.as_str()) {
                    error!(order = order_id, error = %err, "ledger status record failed");
                }
                continue;
            };
            if previous == status.as_str() {
                continue;
            }
            if *status == OrderStatus::Completed {
                // Dispatch before persisting so a crash in between yields a
                // duplicate, never a lost completion.
                let recipients = match self.ledger.recipients(NotifyKind::Orders) {
                    Ok(recipients) => recipients,
                    Err(err) => {
                        error!(order = order_id, error = %err, "recipient lookup failed");
                        continue;
                    }
                };
                let message = render_completed_order(order, &self.base_url);
                if let Err(err) = self.notifier.notify(&recipients, &message).await {
                    warn!(order = order_id, error = %err, "completion notify failed");
                    continue; // status not persisted → retried next poll
                }
                info!(
                    order = order_id,
                    buyer = %order.buyer_label(),
                    "order completed"
                );
            } else {
                debug!(order = order_id, from = %previous, to = %status, "status change");
            }
            if let Err(err) = self.ledger.set_order_status(order_id, status.as_str()) {
                error!(
                    order = order_id,
                    error = %err,
                    "status write failed; expect a duplicate notification"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ledger_with_subscriber, order, test_creds, FakeMarket, RecordingNotifier};
    use std::sync::atomic::Ordering;

    fn watcher(
        api: Arc<FakeMarket>,
        ledger: Arc<Ledger>,
        notifier: Arc<RecordingNotifier>,
    ) -> OrderWatcher<FakeMarket, RecordingNotifier> {
        OrderWatcher::new(
            api,
            ledger,
            notifier,
            CredentialSource::new(None),
            &Settings::default(),
        )
    }

    #[tokio::test]
    async fn created_order_announced_once() {
        let api = Arc::new(FakeMarket::default());
        *api.orders.lock().unwrap() = vec![order("o1", "CREATED")];
        let ledger = ledger_with_subscriber();
        let notifier = Arc::new(RecordingNotifier::default());
        let w = watcher(api, ledger.clone(), notifier.clone());

        w.poll_once(&test_creds()).await.unwrap();
        w.poll_once(&test_creds()).await.unwrap();

        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
        assert!(ledger.is_order_notified_new("o1").unwrap());
        assert_eq!(
            ledger.order_status("o1").unwrap(),
            Some("CREATED".to_string())
        );
    }

    #[tokio::test]
    async fn first_sight_non_created_recorded_silently() {
        let api = Arc::new(FakeMarket::default());
        *api.orders.lock().unwrap() = vec![order("o1", "REFUND")];
        let ledger = ledger_with_subscriber();
        let notifier = Arc::new(RecordingNotifier::default());
        let w = watcher(api, ledger.clone(), notifier.clone());

        w.poll_once(&test_creds()).await.unwrap();

        assert!(notifier.sent.lock().unwrap().is_empty());
        assert!(!ledger.is_order_notified_new("o1").unwrap());
        assert_eq!(
            ledger.order_status("o1").unwrap(),
            Some("REFUND".to_string())
        );
    }

    #[tokio::test]
    async fn already_completed_on_first_sight_never_announced() {
        let api = Arc::new(FakeMarket::default());
        *api.orders.lock().unwrap() = vec![order("o1", "COMPLETED")];
        let ledger = ledger_with_subscriber();
        let notifier = Arc::new(RecordingNotifier::default());
        let w = watcher(api, ledger.clone(), notifier.clone());

        for _ in 0..3 {
            w.poll_once(&test_creds()).await.unwrap();
        }

        assert!(notifier.sent.lock().unwrap().is_empty());
        assert_eq!(
            ledger.order_status("o1").unwrap(),
            Some("COMPLETED".to_string())
        );
    }

    #[tokio::test]
    async fn completion_transition_announces_exactly_once() {
        let api = Arc::new(FakeMarket::default());
        *api.orders.lock().unwrap() = vec![order("o1", "CREATED")];
        let ledger = ledger_with_subscriber();
        let notifier = Arc::new(RecordingNotifier::default());
        let w = watcher(api.clone(), ledger.clone(), notifier.clone());

        w.poll_once(&test_creds()).await.unwrap(); // new-order announcement
        *api.orders.lock().unwrap() = vec![order("o1", "COMPLETED")];
        for _ in 0..4 {
            w.poll_once(&test_creds()).await.unwrap();
        }

        let texts = notifier.texts();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].contains("New order"));
        assert!(texts[1].contains("completed"));
        assert_eq!(
            ledger.order_status("o1").unwrap(),
            Some("COMPLETED".to_string())
        );
    }

    #[tokio::test]
    async fn opaque_transition_recorded_without_announcement() {
        let api = Arc::new(FakeMarket::default());
        *api.orders.lock().unwrap() = vec![order("o1", "CREATED")];
        let ledger = ledger_with_subscriber();
        let notifier = Arc::new(RecordingNotifier::default());
        let w = watcher(api.clone(), ledger.clone(), notifier.clone());

        w.poll_once(&test_creds()).await.unwrap();
        *api.orders.lock().unwrap() = vec![order("o1", "DISPUTE_OPENED")];
        w.poll_once(&test_creds()).await.unwrap();

        assert_eq!(notifier.sent.lock().unwrap().len(), 1); // only the new-order one
        assert_eq!(
            ledger.order_status("o1").unwrap(),
            Some("DISPUTE_OPENED".to_string())
        );
    }

    #[tokio::test]
    async fn failed_completion_dispatch_retries_next_poll() {
        let api = Arc::new(FakeMarket::default());
        *api.orders.lock().unwrap() = vec![order("o1", "CREATED")];
        let ledger = ledger_with_subscriber();
        let notifier = Arc::new(RecordingNotifier::default());
        let w = watcher(api.clone(), ledger.clone(), notifier.clone());

        w.poll_once(&test_creds()).await.unwrap();
        *api.orders.lock().unwrap() = vec![order("o1", "COMPLETED")];
        notifier.fail.store(true, Ordering::SeqCst);
        w.poll_once(&test_creds()).await.unwrap();

        // status not persisted while the sink is down
        assert_eq!(
            ledger.order_status("o1").unwrap(),
            Some("CREATED".to_string())
        );

        notifier.fail.store(false, Ordering::SeqCst);
        w.poll_once(&test_creds()).await.unwrap();
        assert_eq!(
            ledger.order_status("o1").unwrap(),
            Some("COMPLETED".to_string())
        );
        assert_eq!(notifier.sent.lock().unwrap().len(), 2);
    }
}
