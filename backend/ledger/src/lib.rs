//! # Ledger
//!
//! Domain types shared by the storefront server and the reconciliation CLI.
//!
//! ## Orders
//!
//! - One row per purchased item
//! - Multi-item checkouts share a `batch_order_id`, each row knows its `item_index` out of `total_items`
//! - `transaction_signature` holds either a Stripe PaymentIntent id, a Solana signature or a synthetic free order marker
//!
//! ## Lifecycle
//!
//! ```text
//! draft ──▶ pending_payment ──▶ confirmed
//!   │                  └──────▶ error
//!   ├──────(free)──────────────▶ confirmed
//!   └──────────────────────────▶ error
//! ```
//!
//! `confirmed` and `error` are terminal.
//!
//! ## Money
//!
//! - Card prices are integer cents
//! - SOL amounts stay `f64`, they are recorded for display and bookkeeping only, never charged from here
pub mod metadata;
pub mod order;
pub mod pricing;
pub mod reference;
pub mod status;

pub use metadata::PaymentMetadata;
pub use order::{NewOrder, Order, OrderPatch, order_number};
pub use pricing::{
    Coupon, DiscountKind, MIN_CARD_CHARGE_CENTS, Quote, quote, split_amount, split_cents, usd_to_cents,
};
pub use reference::{PaymentMethod, PaymentReference, is_wallet_address};
pub use status::OrderStatus;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Unknown order status: {0}")]
    UnknownStatus(String),

    #[error("Unrecognized transaction signature")]
    InvalidReference,

    #[error("Unknown discount type: {0}")]
    UnknownDiscount(String),
}
