use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use ledger::{Coupon, NewOrder, Order, OrderPatch, OrderStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    OrderFilter, OrderStore, StoreError, StoreResult, attached_signatures, batch_drafts,
    check_transition,
};

#[derive(Default)]
struct Inner {
    // insertion order doubles as creation order
    orders: Vec<Order>,
    coupons: HashMap<String, Coupon>,
}

impl Inner {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.orders.iter().position(|order| order.id == id)
    }
}

#[derive(Default)]
pub struct MemoryOrderStore {
    inner: Mutex<Inner>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_coupon(&self, coupon: Coupon) {
        let mut inner = self.inner.lock().await;

        inner.coupons.insert(coupon.code.to_uppercase(), coupon);
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn create_order(&self, new: NewOrder) -> StoreResult<Order> {
        let order = Order::draft(new, None, Utc::now());

        self.inner.lock().await.orders.push(order.clone());

        Ok(order)
    }

    async fn create_batch(&self, items: Vec<NewOrder>) -> StoreResult<Vec<Order>> {
        let orders = batch_drafts(items, Utc::now());

        self.inner.lock().await.orders.extend(orders.iter().cloned());

        Ok(orders)
    }

    async fn get_order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let inner = self.inner.lock().await;

        Ok(inner.orders.iter().find(|order| order.id == id).cloned())
    }

    async fn batch_orders(&self, batch_order_id: Uuid) -> StoreResult<Vec<Order>> {
        let inner = self.inner.lock().await;

        let mut orders: Vec<Order> = inner
            .orders
            .iter()
            .filter(|order| order.batch_order_id == Some(batch_order_id))
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.item_index);

        Ok(orders)
    }

    async fn latest_draft_for_wallet(&self, wallet_address: &str) -> StoreResult<Option<Order>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .orders
            .iter()
            .rev()
            .find(|order| order.wallet_address == wallet_address && order.status == OrderStatus::Draft)
            .cloned())
    }

    async fn orders_by_signature(&self, signature: &str) -> StoreResult<Vec<Order>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .orders
            .iter()
            .filter(|order| order.transaction_signature.as_deref() == Some(signature))
            .cloned()
            .collect())
    }

    async fn list_orders(&self, filter: &OrderFilter) -> StoreResult<Vec<Order>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .orders
            .iter()
            .rev()
            .filter(|order| filter.matches(order))
            .take(filter.limit() as usize)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        changes: &[(Uuid, OrderPatch)],
        expected: &[OrderStatus],
    ) -> StoreResult<Vec<Order>> {
        let mut inner = self.inner.lock().await;

        let mut positions = Vec::with_capacity(changes.len());
        for (id, patch) in changes {
            let position = inner.position(*id).ok_or(StoreError::NotFound(*id))?;
            check_transition(&inner.orders[position], expected, patch)?;
            positions.push(position);
        }

        for signature in attached_signatures(changes) {
            let taken = inner.orders.iter().any(|order| {
                order.transaction_signature.as_deref() == Some(signature)
                    && !changes.iter().any(|(id, _)| *id == order.id)
            });

            if taken {
                return Err(StoreError::SignatureInUse(signature.to_string()));
            }
        }

        let now = Utc::now();
        let mut updated = Vec::with_capacity(changes.len());
        for ((_, patch), position) in changes.iter().zip(positions) {
            let order = &mut inner.orders[position];
            order.apply(patch, now);
            updated.push(order.clone());
        }

        Ok(updated)
    }

    async fn find_coupon(&self, code: &str) -> StoreResult<Option<Coupon>> {
        let inner = self.inner.lock().await;

        Ok(inner.coupons.get(&code.to_uppercase()).cloned())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
