//! # Order Transactions
//!
//! Attaching payment references to orders and settling them afterwards.
//!
//! ## Attach
//!
//! - Targets: a whole batch, a single order (pulled up to its batch if it has one), or as a last resort the latest draft of a wallet
//! - Attaching the same reference twice is a no-op, the reference doubles as an idempotency key
//! - A reference already held by another order is refused
//! - Card and crypto references move drafts to `pending_payment`, free markers move them straight to `confirmed`
//!
//! ## Settle
//!
//! - Every row holding the reference moves from `pending_payment` to `confirmed` or `error`
//! - Settling to the status the rows already have is a no-op
use std::collections::HashSet;

use ledger::{
    Order, OrderPatch, OrderStatus, PaymentMetadata, PaymentMethod, PaymentReference, split_amount,
};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{database::OrderStore, error::AppError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderTransaction {
    pub order_id: Option<Uuid>,
    pub batch_order_id: Option<Uuid>,
    pub wallet_address: Option<String>,
    pub transaction_signature: String,
    /// Omitted for card and free references, the rows then keep their current amount.
    pub amount_sol: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmOrderTransaction {
    pub transaction_signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTransactionStatus {
    pub transaction_signature: String,
    pub status: OrderStatus,
}

pub async fn update_order_transaction(
    store: &dyn OrderStore,
    request: UpdateOrderTransaction,
) -> Result<Vec<Order>, AppError> {
    let reference = PaymentReference::parse(&request.transaction_signature)
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    if let Some(amount_sol) = request.amount_sol
        && (!amount_sol.is_finite() || amount_sol < 0.0)
    {
        return Err(AppError::InvalidInput(format!("Invalid amountSol: {amount_sol}")));
    }

    let orders = resolve_targets(
        store,
        request.order_id,
        request.batch_order_id,
        request.wallet_address.as_deref(),
    )
    .await?;

    let metadata = vec![PaymentMetadata::default(); orders.len()];

    attach_reference(store, &orders, &reference, request.amount_sol, metadata).await
}

pub async fn confirm_order_transaction(
    store: &dyn OrderStore,
    request: ConfirmOrderTransaction,
) -> Result<Vec<Order>, AppError> {
    settle(store, &request.transaction_signature, OrderStatus::Confirmed).await
}

pub async fn update_transaction_status(
    store: &dyn OrderStore,
    request: UpdateTransactionStatus,
) -> Result<Vec<Order>, AppError> {
    if !request.status.is_terminal() {
        return Err(AppError::InvalidInput(format!(
            "Status must be confirmed or error, got {}",
            request.status
        )));
    }

    settle(store, &request.transaction_signature, request.status).await
}

/// Resolves which rows a payment is for. Batches always travel together.
pub async fn resolve_targets(
    store: &dyn OrderStore,
    order_id: Option<Uuid>,
    batch_order_id: Option<Uuid>,
    wallet_address: Option<&str>,
) -> Result<Vec<Order>, AppError> {
    let order = if let Some(batch_order_id) = batch_order_id {
        return batch(store, batch_order_id).await;
    } else if let Some(order_id) = order_id {
        store
            .get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No order with id {order_id}")))?
    } else if let Some(wallet_address) = wallet_address {
        warn!(wallet_address, "No order id given, falling back to the latest draft");

        store
            .latest_draft_for_wallet(wallet_address)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No draft order for wallet {wallet_address}")))?
    } else {
        return Err(AppError::InvalidInput(
            "One of orderId, batchOrderId or walletAddress is required".to_string(),
        ));
    };

    match order.batch_order_id {
        Some(batch_order_id) => batch(store, batch_order_id).await,
        None => Ok(vec![order]),
    }
}

async fn batch(store: &dyn OrderStore, batch_order_id: Uuid) -> Result<Vec<Order>, AppError> {
    let orders = store.batch_orders(batch_order_id).await?;

    if orders.is_empty() {
        return Err(AppError::NotFound(format!("No orders in batch {batch_order_id}")));
    }

    Ok(orders)
}

/// The free marker a checkout of these rows must carry.
pub fn free_reference(orders: &[Order]) -> Option<PaymentReference> {
    let first = orders.first()?;

    Some(PaymentReference::free(first.batch_order_id.unwrap_or(first.id)))
}

/// Moves `orders` out of draft with `reference` attached.
///
/// `metadata` is merged into each row, index for index. `amount_sol`, when given, is the
/// total for all rows and gets split by each row's final price.
pub async fn attach_reference(
    store: &dyn OrderStore,
    orders: &[Order],
    reference: &PaymentReference,
    amount_sol: Option<f64>,
    metadata: Vec<PaymentMetadata>,
) -> Result<Vec<Order>, AppError> {
    let target = match reference.method() {
        PaymentMethod::Free => OrderStatus::Confirmed,
        PaymentMethod::Stripe | PaymentMethod::Solana => OrderStatus::PendingPayment,
    };

    let already_attached = orders.iter().all(|order| {
        order.transaction_signature.as_deref() == Some(reference.as_str())
            && matches!(order.status, OrderStatus::PendingPayment | OrderStatus::Confirmed)
    });
    if already_attached {
        info!(signature = %reference, orders = orders.len(), "Reference already attached");
        return Ok(orders.to_vec());
    }

    // fast path, the store refuses a taken signature again inside the transition
    let ids: HashSet<Uuid> = orders.iter().map(|order| order.id).collect();
    let holders = store.orders_by_signature(reference.as_str()).await?;
    if holders.iter().any(|holder| !ids.contains(&holder.id)) {
        return Err(AppError::Conflict(format!(
            "Transaction signature {reference} is attached to another order"
        )));
    }

    if reference.method() == PaymentMethod::Free {
        check_free(orders, &metadata, reference)?;
    }

    let weights: Vec<i64> = orders
        .iter()
        .zip(&metadata)
        .map(|(order, patch)| patch.final_price.unwrap_or_else(|| order.final_price_cents()))
        .collect();
    let amounts: Vec<Option<f64>> = match amount_sol {
        Some(total) => split_amount(total, &weights).into_iter().map(Some).collect(),
        None => vec![None; orders.len()],
    };

    let changes: Vec<(Uuid, OrderPatch)> = orders
        .iter()
        .zip(metadata)
        .zip(amounts)
        .map(|((order, mut patch), amount_sol)| {
            patch.payment_method = Some(reference.method());

            (
                order.id,
                OrderPatch {
                    status: target,
                    transaction_signature: Some(reference.as_str().to_string()),
                    amount_sol,
                    payment_metadata: Some(patch),
                },
            )
        })
        .collect();

    let updated = store.transition(&changes, &[OrderStatus::Draft]).await?;

    info!(
        signature = %reference,
        batch_order_id = ?updated.first().and_then(|order| order.batch_order_id),
        status = %target,
        orders = updated.len(),
        "Attached payment reference"
    );

    Ok(updated)
}

/// Only a coupon covering the whole price makes an order free.
fn check_free(
    orders: &[Order],
    metadata: &[PaymentMetadata],
    reference: &PaymentReference,
) -> Result<(), AppError> {
    if free_reference(orders).as_ref() != Some(reference) {
        return Err(AppError::InvalidInput(format!(
            "Free order marker {reference} does not belong to these orders"
        )));
    }

    let mut discount = 0;
    let mut has_coupon = false;
    let mut all_free = true;

    for (order, patch) in orders.iter().zip(metadata) {
        let stored = &order.payment_metadata;

        has_coupon |= patch.coupon_code.as_ref().or(stored.coupon_code.as_ref()).is_some();
        discount += patch.coupon_discount.or(stored.coupon_discount).unwrap_or(0).max(0);
        all_free &= patch.final_price.unwrap_or_else(|| order.final_price_cents()) == 0;
    }

    if !has_coupon || discount == 0 {
        return Err(AppError::InvalidInput(
            "Only orders fully covered by a coupon can be confirmed as free".to_string(),
        ));
    }

    if !all_free {
        return Err(AppError::InvalidInput(
            "Orders with an amount due cannot be confirmed as free".to_string(),
        ));
    }

    Ok(())
}

/// Moves every row holding `signature` from `pending_payment` to `status`.
pub async fn settle(
    store: &dyn OrderStore,
    signature: &str,
    status: OrderStatus,
) -> Result<Vec<Order>, AppError> {
    let orders = store.orders_by_signature(signature).await?;

    if orders.is_empty() {
        return Err(AppError::NotFound(format!(
            "No order with transaction signature {signature}"
        )));
    }

    let changes: Vec<(Uuid, OrderPatch)> = orders
        .iter()
        .filter(|order| order.status != status)
        .map(|order| (order.id, OrderPatch::status(status)))
        .collect();

    if changes.is_empty() {
        info!(signature, %status, "Orders already settled");
        return Ok(orders);
    }

    let updated = store.transition(&changes, &[OrderStatus::PendingPayment]).await?;
    info!(signature, %status, orders = updated.len(), "Settled orders");

    Ok(store.orders_by_signature(signature).await?)
}

/// Best effort, a failure here is logged and swallowed.
pub async fn mark_error(store: &dyn OrderStore, orders: &[Order]) {
    let changes: Vec<(Uuid, OrderPatch)> = orders
        .iter()
        .map(|order| (order.id, OrderPatch::status(OrderStatus::Error)))
        .collect();

    match store
        .transition(&changes, &[OrderStatus::Draft, OrderStatus::PendingPayment])
        .await
    {
        Ok(updated) => info!(orders = updated.len(), "Marked orders as error"),
        Err(e) => warn!(error = %e, "Failed to mark orders as error"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use ledger::{Coupon, NewOrder};
    use serde_json::json;
    use tokio::sync::Barrier;

    use super::*;
    use crate::database::{MemoryOrderStore, OrderFilter, StoreResult};

    pub(crate) const WALLET: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
    pub(crate) const SOLANA_SIG: &str =
        "5VERv8NMvzbJMEkV8xnrLkEaWRtSz9CosKDYjCJjBRnbJLgp8uirBgmQpjKhoR4tjF3ZpRzrFmBV6UjKdiSZkQUW";

    pub(crate) fn new_order(final_price: i64) -> NewOrder {
        NewOrder {
            product_id: Uuid::new_v4(),
            collection_id: None,
            variant_selections: json!({}),
            shipping_address: json!({ "city": "Austin" }),
            contact_info: json!({ "email": "buyer@example.com" }),
            wallet_address: WALLET.to_string(),
            amount_sol: 0.0,
            payment_metadata: PaymentMetadata {
                original_price: Some(final_price),
                final_price: Some(final_price),
                ..Default::default()
            },
        }
    }

    /// A draft whose whole price was taken off by a coupon.
    fn couponed_order(original_price: i64) -> NewOrder {
        let mut order = new_order(0);
        order.payment_metadata.original_price = Some(original_price);
        order.payment_metadata.coupon_code = Some("FREEMERCH".into());
        order.payment_metadata.coupon_discount = Some(original_price);
        order
    }

    /// Holds each `orders_by_signature` caller at the barrier until the other one arrives.
    struct LockstepStore {
        inner: MemoryOrderStore,
        barrier: Barrier,
    }

    #[async_trait]
    impl OrderStore for LockstepStore {
        async fn create_order(&self, new: NewOrder) -> StoreResult<Order> {
            self.inner.create_order(new).await
        }

        async fn create_batch(&self, items: Vec<NewOrder>) -> StoreResult<Vec<Order>> {
            self.inner.create_batch(items).await
        }

        async fn get_order(&self, id: Uuid) -> StoreResult<Option<Order>> {
            self.inner.get_order(id).await
        }

        async fn batch_orders(&self, batch_order_id: Uuid) -> StoreResult<Vec<Order>> {
            self.inner.batch_orders(batch_order_id).await
        }

        async fn latest_draft_for_wallet(&self, wallet_address: &str) -> StoreResult<Option<Order>> {
            self.inner.latest_draft_for_wallet(wallet_address).await
        }

        async fn orders_by_signature(&self, signature: &str) -> StoreResult<Vec<Order>> {
            let orders = self.inner.orders_by_signature(signature).await?;
            self.barrier.wait().await;
            Ok(orders)
        }

        async fn list_orders(&self, filter: &OrderFilter) -> StoreResult<Vec<Order>> {
            self.inner.list_orders(filter).await
        }

        async fn transition(
            &self,
            changes: &[(Uuid, OrderPatch)],
            expected: &[OrderStatus],
        ) -> StoreResult<Vec<Order>> {
            self.inner.transition(changes, expected).await
        }

        async fn find_coupon(&self, code: &str) -> StoreResult<Option<Coupon>> {
            self.inner.find_coupon(code).await
        }

        async fn health_check(&self) -> StoreResult<()> {
            self.inner.health_check().await
        }
    }

    fn request(order_id: Option<Uuid>, signature: &str) -> UpdateOrderTransaction {
        UpdateOrderTransaction {
            order_id,
            batch_order_id: None,
            wallet_address: None,
            transaction_signature: signature.to_string(),
            amount_sol: Some(1.5),
        }
    }

    #[tokio::test]
    async fn test_attach_solana_signature() {
        let store = MemoryOrderStore::new();
        let order = store.create_order(new_order(2000)).await.unwrap();

        let updated = update_order_transaction(&store, request(Some(order.id), SOLANA_SIG))
            .await
            .unwrap();

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].status, OrderStatus::PendingPayment);
        assert_eq!(updated[0].transaction_signature.as_deref(), Some(SOLANA_SIG));
        assert_eq!(updated[0].amount_sol, 1.5);
        assert_eq!(updated[0].payment_metadata.payment_method, Some(PaymentMethod::Solana));
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let store = MemoryOrderStore::new();
        let order = store.create_order(new_order(2000)).await.unwrap();

        let first = update_order_transaction(&store, request(Some(order.id), SOLANA_SIG))
            .await
            .unwrap();
        let second = update_order_transaction(&store, request(Some(order.id), SOLANA_SIG))
            .await
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_second_signature_conflicts() {
        let store = MemoryOrderStore::new();
        let order = store.create_order(new_order(2000)).await.unwrap();

        update_order_transaction(&store, request(Some(order.id), "pi_first"))
            .await
            .unwrap();
        let result = update_order_transaction(&store, request(Some(order.id), "pi_second")).await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_signature_reuse_across_orders_conflicts() {
        let store = MemoryOrderStore::new();
        let first = store.create_order(new_order(2000)).await.unwrap();
        let second = store.create_order(new_order(2000)).await.unwrap();

        update_order_transaction(&store, request(Some(first.id), SOLANA_SIG))
            .await
            .unwrap();
        let result = update_order_transaction(&store, request(Some(second.id), SOLANA_SIG)).await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        let second = store.get_order(second.id).await.unwrap().unwrap();
        assert_eq!(second.status, OrderStatus::Draft);
    }

    #[tokio::test]
    async fn test_concurrent_attach_of_one_signature() {
        let store = LockstepStore {
            inner: MemoryOrderStore::new(),
            barrier: Barrier::new(2),
        };
        let first = store.create_order(new_order(2000)).await.unwrap();
        let second = store.create_order(new_order(2000)).await.unwrap();

        // both calls see no holder before either one writes
        let (a, b) = tokio::join!(
            update_order_transaction(&store, request(Some(first.id), SOLANA_SIG)),
            update_order_transaction(&store, request(Some(second.id), SOLANA_SIG)),
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(a.err().or(b.err()), Some(AppError::Conflict(_))));

        let holders = store.inner.orders_by_signature(SOLANA_SIG).await.unwrap();
        assert_eq!(holders.len(), 1);
    }

    #[tokio::test]
    async fn test_attach_without_amount_keeps_amount() {
        let store = MemoryOrderStore::new();
        let mut new = new_order(2000);
        new.amount_sol = 0.25;
        let order = store.create_order(new).await.unwrap();

        let updated = update_order_transaction(
            &store,
            UpdateOrderTransaction {
                amount_sol: None,
                ..request(Some(order.id), "pi_no_amount")
            },
        )
        .await
        .unwrap();

        assert_eq!(updated[0].status, OrderStatus::PendingPayment);
        assert_eq!(updated[0].amount_sol, 0.25);
    }

    #[tokio::test]
    async fn test_batch_moves_together_and_splits_amount() {
        let store = MemoryOrderStore::new();
        let batch = store
            .create_batch(vec![new_order(1000), new_order(2000)])
            .await
            .unwrap();

        // addressing one member pulls in the whole batch
        let updated = update_order_transaction(&store, request(Some(batch[1].id), SOLANA_SIG))
            .await
            .unwrap();

        assert_eq!(updated.len(), 2);
        assert!(updated.iter().all(|o| o.status == OrderStatus::PendingPayment));
        assert_eq!(updated[0].amount_sol, 0.5);
        assert_eq!(updated[1].amount_sol, 1.0);
    }

    #[tokio::test]
    async fn test_wallet_fallback_picks_latest_draft() {
        let store = MemoryOrderStore::new();
        store.create_order(new_order(1000)).await.unwrap();
        let latest = store.create_order(new_order(1000)).await.unwrap();

        let updated = update_order_transaction(
            &store,
            UpdateOrderTransaction {
                wallet_address: Some(WALLET.to_string()),
                ..request(None, SOLANA_SIG)
            },
        )
        .await
        .unwrap();

        assert_eq!(updated[0].id, latest.id);
    }

    #[tokio::test]
    async fn test_missing_targets() {
        let store = MemoryOrderStore::new();

        let unknown = update_order_transaction(&store, request(Some(Uuid::new_v4()), SOLANA_SIG)).await;
        let nothing = update_order_transaction(&store, request(None, SOLANA_SIG)).await;

        assert!(matches!(unknown, Err(AppError::NotFound(_))));
        assert!(matches!(nothing, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_invalid_input() {
        let store = MemoryOrderStore::new();
        let order = store.create_order(new_order(1000)).await.unwrap();

        let bad_signature = update_order_transaction(&store, request(Some(order.id), "hello")).await;
        let bad_amount = update_order_transaction(
            &store,
            UpdateOrderTransaction {
                amount_sol: Some(-1.0),
                ..request(Some(order.id), SOLANA_SIG)
            },
        )
        .await;

        assert!(matches!(bad_signature, Err(AppError::InvalidInput(_))));
        assert!(matches!(bad_amount, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_free_marker_confirms_free_orders_only() {
        let store = MemoryOrderStore::new();
        let free = store.create_order(couponed_order(3000)).await.unwrap();
        let paid = store.create_order(new_order(500)).await.unwrap();
        let zero = store.create_order(new_order(0)).await.unwrap();

        let marker = PaymentReference::free(free.id).into_string();
        let confirmed = update_order_transaction(&store, request(Some(free.id), &marker))
            .await
            .unwrap();
        assert_eq!(confirmed[0].status, OrderStatus::Confirmed);

        let marker = PaymentReference::free(paid.id).into_string();
        let refused = update_order_transaction(&store, request(Some(paid.id), &marker)).await;
        assert!(matches!(refused, Err(AppError::InvalidInput(_))));

        let foreign = PaymentReference::free(Uuid::new_v4()).into_string();
        let refused = update_order_transaction(&store, request(Some(free.id), &foreign)).await;
        assert!(matches!(refused, Err(AppError::InvalidInput(_))));

        // nothing due but no coupon either
        let marker = PaymentReference::free(zero.id).into_string();
        let refused = update_order_transaction(&store, request(Some(zero.id), &marker)).await;
        assert!(matches!(refused, Err(AppError::InvalidInput(_))));
        let zero = store.get_order(zero.id).await.unwrap().unwrap();
        assert_eq!(zero.status, OrderStatus::Draft);
    }

    #[tokio::test]
    async fn test_confirm_and_settle() {
        let store = MemoryOrderStore::new();
        let batch = store
            .create_batch(vec![new_order(1000), new_order(1000)])
            .await
            .unwrap();
        update_order_transaction(&store, request(Some(batch[0].id), "pi_batch"))
            .await
            .unwrap();

        let confirmed = confirm_order_transaction(
            &store,
            ConfirmOrderTransaction {
                transaction_signature: "pi_batch".into(),
            },
        )
        .await
        .unwrap();
        assert!(confirmed.iter().all(|o| o.status == OrderStatus::Confirmed));

        // confirming again is fine, erroring a confirmed order is not
        assert!(settle(&store, "pi_batch", OrderStatus::Confirmed).await.is_ok());
        let result = settle(&store, "pi_batch", OrderStatus::Error).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_update_transaction_status() {
        let store = MemoryOrderStore::new();
        let order = store.create_order(new_order(1000)).await.unwrap();
        update_order_transaction(&store, request(Some(order.id), "pi_fail"))
            .await
            .unwrap();

        let not_terminal = update_transaction_status(
            &store,
            UpdateTransactionStatus {
                transaction_signature: "pi_fail".into(),
                status: OrderStatus::Draft,
            },
        )
        .await;
        assert!(matches!(not_terminal, Err(AppError::InvalidInput(_))));

        let errored = update_transaction_status(
            &store,
            UpdateTransactionStatus {
                transaction_signature: "pi_fail".into(),
                status: OrderStatus::Error,
            },
        )
        .await
        .unwrap();
        assert_eq!(errored[0].status, OrderStatus::Error);

        let unknown = settle(&store, "pi_unknown", OrderStatus::Confirmed).await;
        assert!(matches!(unknown, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_mark_error_is_best_effort() {
        let store = MemoryOrderStore::new();
        let order = store.create_order(new_order(1000)).await.unwrap();

        mark_error(&store, std::slice::from_ref(&order)).await;
        // second time the order is terminal, nothing blows up
        mark_error(&store, std::slice::from_ref(&order)).await;

        let order = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Error);
    }
}
