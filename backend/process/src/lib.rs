//! # Order Reconciliation
//!
//! Sweeps for orders the request path left behind.
//!
//! ## Pending Payments
//!
//! Card orders sit in `pending_payment` until Stripe's webhook arrives. Webhooks get lost
//! (endpoint down, secret rotated, event filtered out), so this asks Stripe directly.
//!
//! - `succeeded` → `confirmed`
//! - `canceled` → `error`
//! - anything else is still in flight and left alone, `requires_payment_method` included since the buyer can retry
//! - Solana signatures are only reported, confirming them needs a chain lookup
//!
//! Rows of a batch share a reference, the reference is looked up once and the batch moves together.
//!
//! ## Abandoned Drafts
//!
//! Drafts that never got a payment attached are moved to `error`, batch by batch.
//!
//! ## Notes
//! - One run handles at most one listing page, run it again to pick up the rest
//! - `--dry-run` does every lookup but writes nothing
use chrono::{DateTime, Utc};
use indicatif::style::TemplateError;
use ledger::{Order, OrderPatch, OrderStatus, PaymentMethod, PaymentReference};
use server::{
    database::{MAX_LIST_LIMIT, OrderFilter, OrderStore, StoreError},
    payments::{PaymentError, PaymentProvider},
    transactions::settle,
};
use thiserror::Error;
use tracing::{info, warn};

pub mod models;
pub mod utils;

use models::{Action, Summary};
use utils::{group_by, intent_action, progress_bar};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to list orders: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid progress bar template: {0}")]
    Template(#[from] TemplateError),
}

async fn stale_orders(
    store: &dyn OrderStore,
    status: OrderStatus,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Order>, StoreError> {
    let filter = OrderFilter {
        status: Some(status),
        updated_before: Some(cutoff),
        limit: Some(MAX_LIST_LIMIT),
        ..Default::default()
    };

    let orders = store.list_orders(&filter).await?;
    if orders.len() as i64 >= MAX_LIST_LIMIT {
        warn!(%status, "Listing limit reached, remaining orders are left for the next run");
    }

    Ok(orders)
}

async fn pending_action(
    payments: &dyn PaymentProvider,
    signature: &str,
) -> Result<Action, PaymentError> {
    let Ok(reference) = PaymentReference::parse(signature) else {
        return Ok(Action::Report);
    };

    match reference.method() {
        PaymentMethod::Stripe => {
            let intent = payments.retrieve_payment_intent(reference.as_str()).await?;
            Ok(intent_action(intent.status))
        }
        PaymentMethod::Solana | PaymentMethod::Free => Ok(Action::Report),
    }
}

/// Settles `pending_payment` orders last touched before `cutoff` from their PaymentIntent's state.
pub async fn reconcile_pending(
    store: &dyn OrderStore,
    payments: &dyn PaymentProvider,
    cutoff: DateTime<Utc>,
    dry_run: bool,
) -> Result<Summary, ProcessError> {
    let orders = stale_orders(store, OrderStatus::PendingPayment, cutoff).await?;
    let mut summary = Summary {
        scanned: orders.len(),
        dry_run,
        ..Default::default()
    };

    let groups = group_by(orders, |order| order.transaction_signature.clone().unwrap_or_default());
    let pb = progress_bar(groups.len())?;

    for (signature, group) in groups {
        pb.set_message(format!("Checking {signature}"));

        let action = match pending_action(payments, &signature).await {
            Ok(action) => action,
            Err(e) => {
                warn!(%signature, error = %e, "Failed to look up payment");
                summary.failed += group.len();
                pb.inc(1);
                continue;
            }
        };

        match &action {
            Action::Settle(status) if !dry_run => {
                if let Err(e) = settle(store, &signature, *status).await {
                    warn!(%signature, details = %e.details(), "Failed to settle orders");
                    summary.failed += group.len();
                    pb.inc(1);
                    continue;
                }
                info!(%signature, %status, orders = group.len(), "Settled stale orders");
            }
            Action::Report => pb.println(format!(
                "{signature}: {} order(s) need a manual check",
                group.len()
            )),
            _ => {}
        }

        summary.record(&action, group.len());
        pb.inc(1);
    }

    pb.finish_with_message("Done");
    Ok(summary)
}

/// Moves drafts last touched before `cutoff` to `error`.
pub async fn expire_drafts(
    store: &dyn OrderStore,
    cutoff: DateTime<Utc>,
    dry_run: bool,
) -> Result<Summary, ProcessError> {
    let orders = stale_orders(store, OrderStatus::Draft, cutoff).await?;
    let mut summary = Summary {
        scanned: orders.len(),
        dry_run,
        ..Default::default()
    };

    let groups = group_by(orders, |order| order.batch_order_id.unwrap_or(order.id));
    let pb = progress_bar(groups.len())?;

    for (key, group) in groups {
        pb.set_message(format!("Expiring {key}"));

        if !dry_run {
            let changes: Vec<_> = group
                .iter()
                .map(|order| (order.id, OrderPatch::status(OrderStatus::Error)))
                .collect();

            if let Err(e) = store.transition(&changes, &[OrderStatus::Draft]).await {
                warn!(%key, error = %e, "Failed to expire drafts");
                summary.failed += group.len();
                pb.inc(1);
                continue;
            }
        }

        summary.record(&Action::Expire, group.len());
        pb.inc(1);
    }

    pb.finish_with_message("Done");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use async_trait::async_trait;
    use chrono::Duration;
    use ledger::{NewOrder, PaymentMetadata};
    use serde_json::json;
    use server::{
        database::MemoryOrderStore,
        payments::{CreateIntent, IntentStatus, PaymentIntent},
    };
    use uuid::Uuid;

    use super::*;

    const WALLET: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
    const SOLANA_SIG: &str =
        "5VERv8NMvzbJMEkV8xnrLkEaWRtSz9CosKDYjCJjBRnbJLgp8uirBgmQpjKhoR4tjF3ZpRzrFmBV6UjKdiSZkQUW";

    struct FakeStripe {
        intents: HashMap<&'static str, IntentStatus>,
    }

    impl FakeStripe {
        fn new() -> Self {
            Self {
                intents: HashMap::from([
                    ("pi_paid", IntentStatus::Succeeded),
                    ("pi_canceled", IntentStatus::Canceled),
                    ("pi_processing", IntentStatus::Processing),
                    ("pi_declined", IntentStatus::RequiresPaymentMethod),
                ]),
            }
        }
    }

    #[async_trait]
    impl PaymentProvider for FakeStripe {
        async fn create_payment_intent(&self, _: CreateIntent) -> Result<PaymentIntent, PaymentError> {
            Err(PaymentError::Decode("not used".into()))
        }

        async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, PaymentError> {
            let status = self.intents.get(id).copied().ok_or_else(|| PaymentError::Stripe {
                message: format!("No such payment_intent: '{id}'"),
                code: Some("resource_missing".into()),
            })?;

            Ok(PaymentIntent {
                id: id.to_string(),
                client_secret: None,
                status,
                amount: 1000,
                metadata: BTreeMap::new(),
            })
        }
    }

    fn new_order() -> NewOrder {
        NewOrder {
            product_id: Uuid::new_v4(),
            collection_id: None,
            variant_selections: json!({}),
            shipping_address: json!({ "city": "Lisbon" }),
            contact_info: json!({}),
            wallet_address: WALLET.to_string(),
            amount_sol: 0.0,
            payment_metadata: PaymentMetadata::default(),
        }
    }

    async fn pending(store: &MemoryOrderStore, signature: &str) -> Uuid {
        let order = store.create_order(new_order()).await.unwrap();
        let patch = OrderPatch {
            status: OrderStatus::PendingPayment,
            transaction_signature: Some(signature.to_string()),
            amount_sol: None,
            payment_metadata: None,
        };

        store
            .transition(&[(order.id, patch)], &[OrderStatus::Draft])
            .await
            .unwrap();

        order.id
    }

    async fn status_of(store: &MemoryOrderStore, id: Uuid) -> OrderStatus {
        store.get_order(id).await.unwrap().unwrap().status
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + Duration::minutes(1)
    }

    #[tokio::test]
    async fn test_reconcile_pending() {
        let store = MemoryOrderStore::new();
        let paid = pending(&store, "pi_paid").await;
        let canceled = pending(&store, "pi_canceled").await;
        let processing = pending(&store, "pi_processing").await;
        let solana = pending(&store, SOLANA_SIG).await;
        let missing = pending(&store, "pi_missing").await;
        let declined = pending(&store, "pi_declined").await;

        let summary = reconcile_pending(&store, &FakeStripe::new(), later(), false)
            .await
            .unwrap();

        assert_eq!(
            summary,
            Summary {
                scanned: 6,
                confirmed: 1,
                errored: 1,
                reported: 1,
                untouched: 2,
                failed: 1,
                dry_run: false,
            }
        );
        assert_eq!(status_of(&store, paid).await, OrderStatus::Confirmed);
        assert_eq!(status_of(&store, canceled).await, OrderStatus::Error);
        assert_eq!(status_of(&store, processing).await, OrderStatus::PendingPayment);
        assert_eq!(status_of(&store, solana).await, OrderStatus::PendingPayment);
        assert_eq!(status_of(&store, missing).await, OrderStatus::PendingPayment);
        assert_eq!(status_of(&store, declined).await, OrderStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = MemoryOrderStore::new();
        let paid = pending(&store, "pi_paid").await;

        let summary = reconcile_pending(&store, &FakeStripe::new(), later(), true)
            .await
            .unwrap();

        assert_eq!(summary.confirmed, 1);
        assert!(summary.dry_run);
        assert_eq!(status_of(&store, paid).await, OrderStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_recent_orders_are_left_alone() {
        let store = MemoryOrderStore::new();
        let paid = pending(&store, "pi_paid").await;

        let cutoff = Utc::now() - Duration::minutes(30);
        let summary = reconcile_pending(&store, &FakeStripe::new(), cutoff, false)
            .await
            .unwrap();

        assert_eq!(summary.scanned, 0);
        assert_eq!(status_of(&store, paid).await, OrderStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_batch_settles_once() {
        let store = MemoryOrderStore::new();
        let batch = store
            .create_batch(vec![new_order(), new_order(), new_order()])
            .await
            .unwrap();
        let changes: Vec<_> = batch
            .iter()
            .map(|order| {
                (
                    order.id,
                    OrderPatch {
                        status: OrderStatus::PendingPayment,
                        transaction_signature: Some("pi_paid".into()),
                        amount_sol: None,
                        payment_metadata: None,
                    },
                )
            })
            .collect();
        store.transition(&changes, &[OrderStatus::Draft]).await.unwrap();

        let summary = reconcile_pending(&store, &FakeStripe::new(), later(), false)
            .await
            .unwrap();

        assert_eq!(summary.confirmed, 3);
        for order in batch {
            assert_eq!(status_of(&store, order.id).await, OrderStatus::Confirmed);
        }
    }

    #[tokio::test]
    async fn test_expire_drafts() {
        let store = MemoryOrderStore::new();
        let single = store.create_order(new_order()).await.unwrap();
        let batch = store.create_batch(vec![new_order(), new_order()]).await.unwrap();
        let paying = pending(&store, "pi_processing").await;

        let summary = expire_drafts(&store, later(), false).await.unwrap();

        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.errored, 3);
        assert_eq!(status_of(&store, single.id).await, OrderStatus::Error);
        for order in batch {
            assert_eq!(status_of(&store, order.id).await, OrderStatus::Error);
        }
        assert_eq!(status_of(&store, paying).await, OrderStatus::PendingPayment);
    }
}
