//! Storefront order and payment backend.
//!
//!
//!
//! # General Infrastructure
//! - The frontend creates orders and payments only through this server, never against the database directly
//! - Card payments go through Stripe PaymentIntents, the browser confirms them with the returned client secret
//! - Crypto payments are signed by the buyer's wallet, the frontend reports the signature back
//! - Stripe tells us about card outcomes through the webhook, a CLI sweeps whatever the webhook missed
//!
//!
//!
//! # Order Flow
//!
//! **Card**
//! 1. `POST /create-payment-intent` creates the draft(s) and the PaymentIntent, orders move to `pending_payment`
//! 2. Browser confirms the card payment with Stripe
//! 3. `POST /stripe-webhook` moves the orders to `confirmed` on success or `error` once the intent is canceled, a declined card leaves them pending for a retry
//!
//! **Crypto**
//! 1. `POST /orders` creates the draft(s)
//! 2. `POST /update-order-transaction` with the Solana signature, orders move to `pending_payment`
//! 3. `POST /confirm-order-transaction` or `POST /update-transaction-status` once the chain says so
//!
//! **Free**
//! - A coupon covering the whole cart confirms the orders immediately, no payment provider involved
//!
//!
//!
//! # Notes
//!
//! ## Concurrency
//! Every status change is a compare-and-swap over the affected rows, inside one database transaction.
//! A webhook racing a manual confirmation loses cleanly with a conflict instead of overwriting.
//!
//! ## Idempotency
//! The transaction signature is the idempotency key. Re-sending the same signature for the same orders
//! succeeds without touching them, sending it for different orders is refused.
//!
//!
//!
//! # Setup
//!
//! Run against Postgres.
//! ```sh
//! DATABASE_URL=postgres://localhost/storefront RUST_LOG=info cargo run -p storefront
//! ```
//!
//! Run without a database, orders live in memory.
//! ```sh
//! STORE=memory RUST_LOG=debug cargo run -p storefront
//! ```
//!
//! Secrets are read from `/run/secrets/<NAME>` first, then from the environment.
use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    http::{
        Method,
        header::{AUTHORIZATION, CONTENT_TYPE, HeaderName},
    },
    routing::{get, post},
};
use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

pub mod checkout;
pub mod config;
pub mod database;
pub mod error;
pub mod payments;
pub mod routes;
pub mod state;
pub mod transactions;

use config::Config;
use routes::{
    confirm_order_transaction_handler, create_orders_handler, create_payment_intent_handler,
    get_order_handler, health_handler, list_orders_handler, stripe_webhook_handler,
    update_order_transaction_handler, update_transaction_status_handler,
};
use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("stripe-signature"),
        ])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health_handler))
        .route("/create-payment-intent", post(create_payment_intent_handler))
        .route("/update-order-transaction", post(update_order_transaction_handler))
        .route("/confirm-order-transaction", post(confirm_order_transaction_handler))
        .route("/update-transaction-status", post(update_transaction_status_handler))
        .route("/stripe-webhook", post(stripe_webhook_handler))
        .route("/orders", get(list_orders_handler).post(create_orders_handler))
        .route("/orders/{id}", get(get_order_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading config...");
    let config = Config::load()?;

    info!("Initializing state...");
    let state = AppState::new(config).await?;

    info!("Starting server...");
    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let app = router(state);

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
