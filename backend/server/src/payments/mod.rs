//! # Card Payments
//!
//! Stripe PaymentIntents, reached over plain HTTPS.
//!
//! ## Flow
//!
//! - Checkout creates an intent for the discounted total and hands the client secret to the frontend
//! - The intent id becomes the order's `transaction_signature`
//! - Stripe reports the outcome through the webhook, the reconciliation CLI polls intents that never reported back
//!
//! ## Metadata
//!
//! Flat string pairs only, see [`ledger::metadata::stripe_metadata`] for the caps.
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub mod stripe;
pub mod webhook;

pub use stripe::StripeClient;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Stripe rejected the request: {message}")]
    Stripe {
        message: String,
        code: Option<String>,
    },

    #[error("Stripe unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected Stripe response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
    pub status: IntentStatus,
    pub amount: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateIntent {
    pub amount_cents: i64,
    pub currency: String,
    pub description: Option<String>,
    pub receipt_email: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Sent as `Idempotency-Key`, a retried checkout for the same order gets the same intent back.
    pub idempotency_key: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_payment_intent(&self, intent: CreateIntent) -> Result<PaymentIntent, PaymentError>;

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, PaymentError>;
}
