//! # Checkout
//!
//! Turns a cart into draft orders and, unless a coupon covers everything, a Stripe PaymentIntent.
//!
//! ## Steps
//!
//! 1. Validate the buyer and price every line in cents
//! 2. Resolve the coupon server-side, the discount is spread over lines by price
//! 3. Free carts are confirmed on the spot with a `free_order_` marker
//! 4. Otherwise create the drafts (or reuse the ones the frontend already holds), create the intent and attach its id
//! 5. If Stripe fails the drafts are marked `error` before the failure is returned
//!
//! A retried checkout for orders still waiting on their intent gets the same client secret back.
//!
//! Wallet payments only need the drafts, [`create_draft_orders`] prices the cart the same way and stops there.
use std::collections::BTreeMap;

use ledger::{
    MIN_CARD_CHARGE_CENTS, NewOrder, Order, OrderStatus, PaymentMetadata, PaymentMethod,
    PaymentReference, Quote, is_wallet_address, metadata::stripe_metadata, quote, split_cents,
    usd_to_cents,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::{
    database::OrderStore,
    error::AppError,
    payments::{CreateIntent, IntentStatus},
    state::AppState,
    transactions::{attach_reference, free_reference, mark_error, resolve_targets},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingInfo {
    pub address: Value,
    #[serde(default)]
    pub contact_info: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutItem {
    pub product_id: Uuid,
    pub collection_id: Option<Uuid>,
    #[serde(default)]
    pub variants: Value,
    #[serde(default)]
    pub variant_prices: BTreeMap<String, f64>,
    pub price: f64,
}

/// `price` and the single-product fields are ignored when `items` is not empty.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntent {
    pub price: Option<f64>,
    #[serde(default)]
    pub product_name: String,
    pub product_id: Option<Uuid>,
    pub collection_id: Option<Uuid>,
    #[serde(default)]
    pub variants: Value,
    #[serde(default)]
    pub variant_prices: BTreeMap<String, f64>,
    pub shipping_info: ShippingInfo,
    pub wallet_address: String,
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub amount_sol: f64,
    pub order_id: Option<Uuid>,
    pub batch_order_id: Option<Uuid>,
    #[serde(default)]
    pub items: Vec<CheckoutItem>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    pub is_free_order: bool,
    pub status: OrderStatus,
}

struct Line {
    item: CheckoutItem,
    cents: i64,
    variant_cents: BTreeMap<String, i64>,
}

/// Validated and priced cart, shared by draft creation and checkout.
struct PricedCart {
    lines: Vec<Line>,
    quote: Quote,
    metadata: Vec<PaymentMetadata>,
    coupon_code: Option<String>,
}

async fn price_cart(store: &dyn OrderStore, request: &CreatePaymentIntent) -> Result<PricedCart, AppError> {
    validate(request)?;
    let lines = checkout_lines(request)?;

    let coupon = match request.coupon_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => Some(
            store
                .find_coupon(code)
                .await?
                .filter(|coupon| coupon.active)
                .ok_or_else(|| AppError::InvalidInput(format!("Invalid or inactive coupon {code}")))?,
        ),
        _ => None,
    };
    let coupon_code = coupon.as_ref().map(|coupon| coupon.code.clone());

    let original_cents = lines
        .iter()
        .try_fold(0i64, |sum, line| sum.checked_add(line.cents))
        .ok_or_else(|| AppError::InvalidInput("Cart total is too large".to_string()))?;
    let quote = quote(original_cents, coupon.as_ref());

    // nothing due is only allowed when a coupon took it off
    if quote.final_cents == 0 && !quote.is_free() {
        return Err(AppError::InvalidInput(
            "Cart total must be greater than zero".to_string(),
        ));
    }

    let metadata = line_metadata(&lines, &quote, coupon_code.as_deref());

    Ok(PricedCart {
        lines,
        quote,
        metadata,
        coupon_code,
    })
}

/// Creates draft orders for a cart that will be paid outside of Stripe, typically with a wallet.
pub async fn create_draft_orders(
    state: &AppState,
    request: CreatePaymentIntent,
) -> Result<Vec<Order>, AppError> {
    let store = state.store.as_ref();
    let cart = price_cart(store, &request).await?;

    create_drafts(store, &request, cart.lines, &cart.metadata).await
}

pub async fn create_payment_intent(
    state: &AppState,
    request: CreatePaymentIntent,
) -> Result<CheckoutResponse, AppError> {
    let store = state.store.as_ref();
    let PricedCart {
        lines,
        quote,
        metadata,
        coupon_code,
    } = price_cart(store, &request).await?;
    let coupon_code = coupon_code.as_deref();

    if !quote.is_free() && quote.final_cents < MIN_CARD_CHARGE_CENTS {
        return Err(AppError::InvalidInput(format!(
            "Amount due must be at least {MIN_CARD_CHARGE_CENTS} cents, got {}",
            quote.final_cents
        )));
    }

    let amount_sol = (request.amount_sol > 0.0).then_some(request.amount_sol);

    let orders = if request.order_id.is_none() && request.batch_order_id.is_none() {
        create_drafts(store, &request, lines, &metadata).await?
    } else {
        let orders = resolve_targets(store, request.order_id, request.batch_order_id, None).await?;

        if let Some(resumed) = resume(state, &orders).await? {
            return Ok(resumed);
        }
        if let Some(order) = orders.iter().find(|order| order.status != OrderStatus::Draft) {
            return Err(AppError::Conflict(format!(
                "Order {} is {}, only drafts can be checked out",
                order.id, order.status
            )));
        }
        if orders.len() != metadata.len() {
            return Err(AppError::InvalidInput(format!(
                "Checkout has {} items but the order has {}",
                metadata.len(),
                orders.len()
            )));
        }

        orders
    };

    if quote.is_free() {
        let reference = free_reference(&orders)
            .ok_or_else(|| AppError::Internal("Checkout produced no orders".to_string()))?;

        let confirmed = attach_reference(store, &orders, &reference, amount_sol, metadata).await?;
        info!(order_id = %confirmed[0].id, coupon = ?coupon_code, "Free order confirmed");

        return Ok(response(&confirmed, None, None));
    }

    let intent = CreateIntent {
        amount_cents: quote.final_cents,
        currency: state.config.currency.clone(),
        description: Some(request.product_name.clone()).filter(|name| !name.is_empty()),
        receipt_email: receipt_email(&request.shipping_info.contact_info),
        metadata: intent_metadata(&orders, &request, &quote, coupon_code),
        idempotency_key: Some(format!("checkout-{}-{}", orders[0].id, quote.final_cents)),
    };

    let created = match state.payments.create_payment_intent(intent).await {
        Ok(created) => created,
        Err(e) => {
            mark_error(store, &orders).await;
            return Err(e.into());
        }
    };

    let reference = PaymentReference::parse(&created.id)
        .map_err(|_| AppError::Internal(format!("Unexpected payment intent id {}", created.id)))?;
    let client_secret = created
        .client_secret
        .clone()
        .ok_or_else(|| AppError::Internal("Stripe returned no client secret".to_string()))?;

    let patches = metadata
        .into_iter()
        .map(|mut patch| {
            patch.payment_intent_id = Some(created.id.clone());
            patch
        })
        .collect();
    let pending = attach_reference(store, &orders, &reference, amount_sol, patches).await?;

    Ok(response(&pending, Some(client_secret), Some(created.id)))
}

fn validate(request: &CreatePaymentIntent) -> Result<(), AppError> {
    if !is_wallet_address(&request.wallet_address) {
        return Err(AppError::InvalidInput(format!(
            "Invalid wallet address {}",
            request.wallet_address
        )));
    }

    if request.shipping_info.address.is_null() {
        return Err(AppError::InvalidInput("Shipping address is required".to_string()));
    }

    if !request.amount_sol.is_finite() || request.amount_sol < 0.0 {
        return Err(AppError::InvalidInput(format!(
            "Invalid amountSol: {}",
            request.amount_sol
        )));
    }

    Ok(())
}

fn to_cents(usd: f64, what: &str) -> Result<i64, AppError> {
    usd_to_cents(usd).ok_or_else(|| AppError::InvalidInput(format!("Invalid {what}: {usd}")))
}

fn checkout_lines(request: &CreatePaymentIntent) -> Result<Vec<Line>, AppError> {
    let items = if request.items.is_empty() {
        let product_id = request
            .product_id
            .ok_or_else(|| AppError::InvalidInput("productId is required".to_string()))?;
        let price = request
            .price
            .ok_or_else(|| AppError::InvalidInput("price is required".to_string()))?;

        vec![CheckoutItem {
            product_id,
            collection_id: request.collection_id,
            variants: request.variants.clone(),
            variant_prices: request.variant_prices.clone(),
            price,
        }]
    } else {
        request.items.clone()
    };

    items
        .into_iter()
        .map(|item| {
            let cents = to_cents(item.price, "price")?;
            let variant_cents = item
                .variant_prices
                .iter()
                .map(|(name, usd)| Ok((name.clone(), to_cents(*usd, "variant price")?)))
                .collect::<Result<_, AppError>>()?;

            Ok(Line {
                item,
                cents,
                variant_cents,
            })
        })
        .collect()
}

fn line_metadata(lines: &[Line], quote: &Quote, coupon_code: Option<&str>) -> Vec<PaymentMetadata> {
    let cents: Vec<i64> = lines.iter().map(|line| line.cents).collect();
    let discounts = split_cents(quote.discount_cents, &cents);

    lines
        .iter()
        .zip(discounts)
        .map(|(line, discount)| {
            let line_quote = Quote {
                original_cents: line.cents,
                discount_cents: discount,
                final_cents: (line.cents - discount).max(0),
            };

            PaymentMetadata {
                variant_prices: line.variant_cents.clone(),
                ..PaymentMetadata::from_quote(&line_quote, coupon_code)
            }
        })
        .collect()
}

async fn create_drafts(
    store: &dyn OrderStore,
    request: &CreatePaymentIntent,
    lines: Vec<Line>,
    metadata: &[PaymentMetadata],
) -> Result<Vec<Order>, AppError> {
    let mut drafts: Vec<NewOrder> = lines
        .into_iter()
        .zip(metadata)
        .map(|(line, payment_metadata)| NewOrder {
            product_id: line.item.product_id,
            collection_id: line.item.collection_id,
            variant_selections: if line.item.variants.is_null() {
                json!({})
            } else {
                line.item.variants
            },
            shipping_address: request.shipping_info.address.clone(),
            contact_info: request.shipping_info.contact_info.clone(),
            wallet_address: request.wallet_address.clone(),
            amount_sol: 0.0,
            payment_metadata: payment_metadata.clone(),
        })
        .collect();

    let orders = if drafts.len() == 1 {
        vec![store.create_order(drafts.remove(0)).await?]
    } else {
        store.create_batch(drafts).await?
    };

    info!(
        order_id = %orders[0].id,
        batch_order_id = ?orders[0].batch_order_id,
        items = orders.len(),
        "Created draft orders"
    );

    Ok(orders)
}

/// Orders already waiting on a live intent get that intent's secret again.
async fn resume(state: &AppState, orders: &[Order]) -> Result<Option<CheckoutResponse>, AppError> {
    let Some(signature) = orders.first().and_then(|order| order.transaction_signature.clone()) else {
        return Ok(None);
    };

    let waiting = orders.iter().all(|order| {
        order.status == OrderStatus::PendingPayment
            && order.transaction_signature.as_deref() == Some(signature.as_str())
            && order.payment_metadata.payment_method == Some(PaymentMethod::Stripe)
    });
    if !waiting {
        return Ok(None);
    }

    let intent = state.payments.retrieve_payment_intent(&signature).await?;
    let resumable = matches!(
        intent.status,
        IntentStatus::RequiresPaymentMethod
            | IntentStatus::RequiresConfirmation
            | IntentStatus::RequiresAction
    );

    Ok(match (resumable, intent.client_secret) {
        (true, Some(client_secret)) => {
            info!(payment_intent_id = %intent.id, "Resuming checkout");
            Some(response(orders, Some(client_secret), Some(intent.id)))
        }
        _ => None,
    })
}

fn receipt_email(contact_info: &Value) -> Option<String> {
    contact_info
        .get("email")
        .and_then(Value::as_str)
        .filter(|email| email.contains('@'))
        .map(str::to_string)
}

fn intent_metadata(
    orders: &[Order],
    request: &CreatePaymentIntent,
    quote: &Quote,
    coupon_code: Option<&str>,
) -> BTreeMap<String, String> {
    let first = &orders[0];
    let mut pairs = vec![
        ("orderId".to_string(), first.id.to_string()),
        ("orderNumber".to_string(), first.order_number.clone()),
        (
            "batchOrderId".to_string(),
            first.batch_order_id.map(|id| id.to_string()).unwrap_or_default(),
        ),
        ("itemCount".to_string(), orders.len().to_string()),
        ("productName".to_string(), request.product_name.clone()),
        ("productId".to_string(), first.product_id.to_string()),
        ("walletAddress".to_string(), request.wallet_address.clone()),
    ];

    pairs.extend(PaymentMetadata::from_quote(quote, coupon_code).to_stripe_metadata());

    stripe_metadata(pairs)
}

fn response(
    orders: &[Order],
    client_secret: Option<String>,
    payment_intent_id: Option<String>,
) -> CheckoutResponse {
    let first = &orders[0];

    CheckoutResponse {
        order_id: first.id,
        batch_order_id: first.batch_order_id,
        client_secret,
        payment_intent_id,
        is_free_order: first.payment_metadata.payment_method == Some(PaymentMethod::Free),
        status: first.status,
    }
}
