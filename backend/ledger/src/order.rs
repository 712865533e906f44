use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{OrderStatus, PaymentMetadata};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub batch_order_id: Option<Uuid>,
    pub item_index: i32,
    pub total_items: i32,
    pub product_id: Uuid,
    pub collection_id: Option<Uuid>,
    pub variant_selections: Value,
    pub shipping_address: Value,
    pub contact_info: Value,
    pub wallet_address: String,
    pub status: OrderStatus,
    pub transaction_signature: Option<String>,
    pub amount_sol: f64,
    pub payment_metadata: PaymentMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the buyer decides at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub product_id: Uuid,
    pub collection_id: Option<Uuid>,
    pub variant_selections: Value,
    pub shipping_address: Value,
    pub contact_info: Value,
    pub wallet_address: String,
    pub amount_sol: f64,
    pub payment_metadata: PaymentMetadata,
}

/// Changes applied together with a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPatch {
    pub status: OrderStatus,
    pub transaction_signature: Option<String>,
    pub amount_sol: Option<f64>,
    pub payment_metadata: Option<PaymentMetadata>,
}

impl OrderPatch {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status,
            transaction_signature: None,
            amount_sol: None,
            payment_metadata: None,
        }
    }
}

impl Order {
    /// `batch` is `(batch_order_id, item_index, total_items)`, indices start at 1.
    pub fn draft(new: NewOrder, batch: Option<(Uuid, i32, i32)>, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        let (batch_order_id, item_index, total_items) = match batch {
            Some((batch_id, index, total)) => (Some(batch_id), index, total),
            None => (None, 1, 1),
        };

        Self {
            id,
            order_number: order_number(id, now),
            batch_order_id,
            item_index,
            total_items,
            product_id: new.product_id,
            collection_id: new.collection_id,
            variant_selections: new.variant_selections,
            shipping_address: new.shipping_address,
            contact_info: new.contact_info,
            wallet_address: new.wallet_address,
            status: OrderStatus::Draft,
            transaction_signature: None,
            amount_sol: new.amount_sol,
            payment_metadata: new.payment_metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Does not check the transition, stores do that before calling.
    pub fn apply(&mut self, patch: &OrderPatch, now: DateTime<Utc>) {
        self.status = patch.status;

        if let Some(signature) = &patch.transaction_signature {
            self.transaction_signature = Some(signature.clone());
        }
        if let Some(amount_sol) = patch.amount_sol {
            self.amount_sol = amount_sol;
        }
        if let Some(metadata) = &patch.payment_metadata {
            self.payment_metadata.merge(metadata.clone());
        }

        self.updated_at = now;
    }

    pub fn final_price_cents(&self) -> i64 {
        self.payment_metadata.final_price.unwrap_or(0)
    }
}

pub fn order_number(id: Uuid, created_at: DateTime<Utc>) -> String {
    let suffix = id.simple().to_string()[..8].to_uppercase();

    format!("ORD-{}-{suffix}", created_at.format("%Y%m%d"))
}
