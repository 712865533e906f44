use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use ledger::{Order, OrderStatus};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    checkout::{self, CreatePaymentIntent},
    database::OrderFilter,
    error::AppError,
    payments::webhook::{IntentOutcome, StripeEvent, verify_webhook_signature},
    state::AppState,
    transactions::{
        self, ConfirmOrderTransaction, UpdateOrderTransaction, UpdateTransactionStatus, settle,
    },
};

const STRIPE_SIGNATURE: &str = "stripe-signature";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOrdersQuery {
    pub wallet_address: Option<String>,
    pub status: Option<OrderStatus>,
    pub limit: Option<i64>,
}

fn success(orders: Vec<Order>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "success": true, "data": orders })))
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    state.store.health_check().await?;

    Ok((StatusCode::OK, Json(json!({ "status": "ok" }))))
}

pub async fn create_payment_intent_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreatePaymentIntent>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let response = checkout::create_payment_intent(&state, request).await?;

    Ok((StatusCode::OK, Json(response)))
}

pub async fn create_orders_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreatePaymentIntent>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let orders = checkout::create_draft_orders(&state, request).await?;

    Ok(success(orders))
}

pub async fn update_order_transaction_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UpdateOrderTransaction>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let orders = transactions::update_order_transaction(state.store.as_ref(), request).await?;

    Ok(success(orders))
}

pub async fn confirm_order_transaction_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ConfirmOrderTransaction>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let orders = transactions::confirm_order_transaction(state.store.as_ref(), request).await?;

    Ok(success(orders))
}

pub async fn update_transaction_status_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UpdateTransactionStatus>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let orders = transactions::update_transaction_status(state.store.as_ref(), request).await?;

    Ok(success(orders))
}

/// Stripe retries anything that is not a 2xx, so events about orders we cannot move are
/// acknowledged and logged instead of failed.
pub async fn stripe_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let header = headers
        .get(STRIPE_SIGNATURE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::InvalidSignature("Missing Stripe-Signature header".to_string()))?;

    if let Err(e) = verify_webhook_signature(
        &body,
        header,
        &state.config.stripe_webhook_secret,
        Utc::now().timestamp(),
    ) {
        warn!(error = %e, "Rejected webhook");
        return Err(AppError::InvalidSignature(e.to_string()));
    }

    let event: StripeEvent =
        serde_json::from_slice(&body).map_err(|e| AppError::MalformedPayload(e.to_string()))?;
    let outcome = event
        .outcome()
        .map_err(|e| AppError::MalformedPayload(e.to_string()))?;

    let (intent_id, status) = match outcome {
        IntentOutcome::Succeeded(id) => (id, OrderStatus::Confirmed),
        IntentOutcome::Canceled(id) => (id, OrderStatus::Error),
        IntentOutcome::Declined(intent_id) => {
            info!(event_id = %event.id, %intent_id, "Payment attempt declined, orders stay pending");
            return Ok((StatusCode::OK, Json(json!({ "received": true }))));
        }
        IntentOutcome::Ignored => {
            info!(event_id = %event.id, kind = %event.kind, "Ignoring webhook event");
            return Ok((StatusCode::OK, Json(json!({ "received": true }))));
        }
    };

    match settle(state.store.as_ref(), &intent_id, status).await {
        Ok(orders) => {
            info!(event_id = %event.id, %intent_id, %status, orders = orders.len(), "Webhook settled orders")
        }
        Err(e @ (AppError::NotFound(_) | AppError::Conflict(_))) => {
            warn!(event_id = %event.id, %intent_id, details = %e.details(), "Webhook did not apply")
        }
        Err(e) => return Err(e),
    }

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}

pub async fn get_order_handler(
    State(state): State<Arc<AppState>>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Path(id) = id?;

    let order = state
        .store
        .get_order(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No order with id {id}")))?;

    Ok((StatusCode::OK, Json(order)))
}

pub async fn list_orders_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListOrdersQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Query(query) = query?;

    let filter = OrderFilter {
        wallet_address: query.wallet_address,
        status: query.status,
        updated_before: None,
        limit: query.limit,
    };

    let orders = state.store.list_orders(&filter).await?;

    Ok(success(orders))
}
