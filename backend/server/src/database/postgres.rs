use std::{collections::HashMap, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger::{Coupon, NewOrder, Order, OrderPatch, OrderStatus, PaymentMetadata};
use serde_json::Value;
use sqlx::{
    FromRow, PgConnection, Pool, Postgres,
    postgres::{PgConnectOptions, PgPoolOptions},
    types::Json,
};
use tracing::info;
use uuid::Uuid;

use super::{
    OrderFilter, OrderStore, StoreError, StoreResult, attached_signatures, batch_drafts,
    check_transition,
};

const SCHEMA: &str = include_str!("schema.sql");

#[derive(FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    batch_order_id: Option<Uuid>,
    item_index: i32,
    total_items: i32,
    product_id: Uuid,
    collection_id: Option<Uuid>,
    variant_selections: Value,
    shipping_address: Value,
    contact_info: Value,
    wallet_address: String,
    status: String,
    transaction_signature: Option<String>,
    amount_sol: f64,
    payment_metadata: Json<PaymentMetadata>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = OrderStatus::from_str(&row.status)
            .map_err(|e| StoreError::Corrupt(format!("order {}: {e}", row.id)))?;

        Ok(Order {
            id: row.id,
            order_number: row.order_number,
            batch_order_id: row.batch_order_id,
            item_index: row.item_index,
            total_items: row.total_items,
            product_id: row.product_id,
            collection_id: row.collection_id,
            variant_selections: row.variant_selections,
            shipping_address: row.shipping_address,
            contact_info: row.contact_info,
            wallet_address: row.wallet_address,
            status,
            transaction_signature: row.transaction_signature,
            amount_sol: row.amount_sol,
            payment_metadata: row.payment_metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct CouponRow {
    code: String,
    discount_type: String,
    discount_value: i64,
    active: bool,
}

fn into_orders(rows: Vec<OrderRow>) -> StoreResult<Vec<Order>> {
    rows.into_iter().map(Order::try_from).collect()
}

fn schema_statements(schema: &str) -> impl Iterator<Item = &str> {
    schema.split(';').filter_map(|statement| {
        let has_sql = statement.lines().any(|line| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with("--")
        });

        has_sql.then_some(statement.trim())
    })
}

pub struct PgOrderStore {
    pool: Pool<Postgres>,
}

impl PgOrderStore {
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(url)?;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(max_connections, "Connected to Postgres");

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

async fn insert_order(conn: &mut PgConnection, order: &Order) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO orders (
            id, order_number, batch_order_id, item_index, total_items, product_id,
            collection_id, variant_selections, shipping_address, contact_info,
            wallet_address, status, transaction_signature, amount_sol, payment_metadata,
            created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
    )
    .bind(order.id)
    .bind(&order.order_number)
    .bind(order.batch_order_id)
    .bind(order.item_index)
    .bind(order.total_items)
    .bind(order.product_id)
    .bind(order.collection_id)
    .bind(&order.variant_selections)
    .bind(&order.shipping_address)
    .bind(&order.contact_info)
    .bind(&order.wallet_address)
    .bind(order.status.as_str())
    .bind(&order.transaction_signature)
    .bind(order.amount_sol)
    .bind(Json(&order.payment_metadata))
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create_order(&self, new: NewOrder) -> StoreResult<Order> {
        let order = Order::draft(new, None, Utc::now());

        let mut tx = self.pool.begin().await?;
        insert_order(&mut tx, &order).await?;
        tx.commit().await?;

        Ok(order)
    }

    async fn create_batch(&self, items: Vec<NewOrder>) -> StoreResult<Vec<Order>> {
        let orders = batch_drafts(items, Utc::now());

        let mut tx = self.pool.begin().await?;
        for order in &orders {
            insert_order(&mut tx, order).await?;
        }
        tx.commit().await?;

        Ok(orders)
    }

    async fn get_order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Order::try_from)
            .transpose()
    }

    async fn batch_orders(&self, batch_order_id: Uuid) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE batch_order_id = $1 ORDER BY item_index",
        )
        .bind(batch_order_id)
        .fetch_all(&self.pool)
        .await?;

        into_orders(rows)
    }

    async fn latest_draft_for_wallet(&self, wallet_address: &str) -> StoreResult<Option<Order>> {
        sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE wallet_address = $1 AND status = 'draft'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(wallet_address)
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    async fn orders_by_signature(&self, signature: &str) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE transaction_signature = $1 ORDER BY item_index",
        )
        .bind(signature)
        .fetch_all(&self.pool)
        .await?;

        into_orders(rows)
    }

    async fn list_orders(&self, filter: &OrderFilter) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders
             WHERE ($1::text IS NULL OR wallet_address = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::timestamptz IS NULL OR updated_at < $3)
             ORDER BY created_at DESC
             LIMIT $4",
        )
        .bind(filter.wallet_address.as_deref())
        .bind(filter.status.map(OrderStatus::as_str))
        .bind(filter.updated_before)
        .bind(filter.limit())
        .fetch_all(&self.pool)
        .await?;

        into_orders(rows)
    }

    async fn transition(
        &self,
        changes: &[(Uuid, OrderPatch)],
        expected: &[OrderStatus],
    ) -> StoreResult<Vec<Order>> {
        let ids: Vec<Uuid> = changes.iter().map(|(id, _)| *id).collect();

        let mut tx = self.pool.begin().await?;

        // serializes attaches of the same signature until commit
        let signatures = attached_signatures(changes);
        for signature in &signatures {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(*signature)
                .execute(&mut *tx)
                .await?;
        }

        // fixed lock order so two batch updates cannot deadlock
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        let mut current: HashMap<Uuid, Order> = into_orders(rows)?
            .into_iter()
            .map(|order| (order.id, order))
            .collect();

        for signature in &signatures {
            let taken: bool = sqlx::query_scalar(
                "SELECT EXISTS (
                    SELECT 1 FROM orders WHERE transaction_signature = $1 AND NOT (id = ANY($2))
                 )",
            )
            .bind(*signature)
            .bind(&ids)
            .fetch_one(&mut *tx)
            .await?;

            if taken {
                return Err(StoreError::SignatureInUse(signature.to_string()));
            }
        }

        let now = Utc::now();
        let mut updated = Vec::with_capacity(changes.len());

        for (id, patch) in changes {
            let order = current.get_mut(id).ok_or(StoreError::NotFound(*id))?;
            check_transition(order, expected, patch)?;
            order.apply(patch, now);

            sqlx::query(
                "UPDATE orders
                 SET status = $1, transaction_signature = $2, amount_sol = $3,
                     payment_metadata = $4, updated_at = $5
                 WHERE id = $6",
            )
            .bind(order.status.as_str())
            .bind(&order.transaction_signature)
            .bind(order.amount_sol)
            .bind(Json(&order.payment_metadata))
            .bind(order.updated_at)
            .bind(order.id)
            .execute(&mut *tx)
            .await?;

            updated.push(order.clone());
        }

        tx.commit().await?;

        Ok(updated)
    }

    async fn find_coupon(&self, code: &str) -> StoreResult<Option<Coupon>> {
        let row = sqlx::query_as::<_, CouponRow>(
            "SELECT code, discount_type, discount_value, active FROM coupons
             WHERE upper(code) = upper($1)",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Coupon::from_parts(&row.code, &row.discount_type, row.discount_value, row.active)
                .map_err(|e| StoreError::Corrupt(format!("coupon {}: {e}", row.code)))
        })
        .transpose()
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        Ok(())
    }
}
