//! # Order Store
//!
//! Persistence for orders and coupons.
//!
//! ## Requirements
//!
//! - Draft creation, single rows or whole batches in one go
//! - Lookups by id, batch, wallet and transaction signature
//! - Status changes as compare-and-swap: a row only moves if it is still in one of the expected statuses
//! - Batches move together or not at all
//! - A transaction signature belongs to one order or one batch, a transition attaching it elsewhere is refused
//!
//! ## Implementation
//!
//! - [`postgres::PgOrderStore`]: production, rows locked with `SELECT ... FOR UPDATE` inside one transaction
//! - [`memory::MemoryOrderStore`]: one mutex around everything, used for tests and local runs
use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::{Coupon, NewOrder, Order, OrderPatch, OrderStatus};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryOrderStore;
pub use postgres::PgOrderStore;

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 200;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Order {0} not found")]
    NotFound(Uuid),

    #[error("Order {id} is {actual}, cannot change it")]
    Conflict { id: Uuid, actual: OrderStatus },

    #[error("Transaction signature {0} is attached to another order")]
    SignatureInUse(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub wallet_address: Option<String>,
    pub status: Option<OrderStatus>,
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl OrderFilter {
    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.wallet_address
            .as_deref()
            .is_none_or(|wallet| order.wallet_address == wallet)
            && self.status.is_none_or(|status| order.status == status)
            && self
                .updated_before
                .is_none_or(|before| order.updated_at < before)
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a single draft order.
    async fn create_order(&self, new: NewOrder) -> StoreResult<Order>;

    /// Inserts every item as a draft sharing one fresh `batch_order_id`.
    async fn create_batch(&self, items: Vec<NewOrder>) -> StoreResult<Vec<Order>>;

    async fn get_order(&self, id: Uuid) -> StoreResult<Option<Order>>;

    /// Ordered by `item_index`.
    async fn batch_orders(&self, batch_order_id: Uuid) -> StoreResult<Vec<Order>>;

    async fn latest_draft_for_wallet(&self, wallet_address: &str) -> StoreResult<Option<Order>>;

    async fn orders_by_signature(&self, signature: &str) -> StoreResult<Vec<Order>>;

    /// Newest first.
    async fn list_orders(&self, filter: &OrderFilter) -> StoreResult<Vec<Order>>;

    /// Applies every patch atomically. Each row must exist, be in one of `expected`
    /// and be allowed to move to its patch's status, otherwise nothing changes.
    ///
    /// A patch carrying a transaction signature already held by a row outside `changes`
    /// fails with [`StoreError::SignatureInUse`].
    async fn transition(
        &self,
        changes: &[(Uuid, OrderPatch)],
        expected: &[OrderStatus],
    ) -> StoreResult<Vec<Order>>;

    /// Case-insensitive.
    async fn find_coupon(&self, code: &str) -> StoreResult<Option<Coupon>>;

    async fn health_check(&self) -> StoreResult<()>;
}

pub(crate) fn check_transition(
    order: &Order,
    expected: &[OrderStatus],
    patch: &OrderPatch,
) -> StoreResult<()> {
    if expected.contains(&order.status) && order.status.can_transition(patch.status) {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            id: order.id,
            actual: order.status,
        })
    }
}

/// Signatures attached by `changes`, each once and in a fixed order.
pub(crate) fn attached_signatures(changes: &[(Uuid, OrderPatch)]) -> BTreeSet<&str> {
    changes
        .iter()
        .filter_map(|(_, patch)| patch.transaction_signature.as_deref())
        .collect()
}

pub(crate) fn batch_drafts(items: Vec<NewOrder>, now: DateTime<Utc>) -> Vec<Order> {
    let batch_order_id = Uuid::new_v4();
    let total = items.len() as i32;

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| Order::draft(item, Some((batch_order_id, index as i32 + 1, total)), now))
        .collect()
}
