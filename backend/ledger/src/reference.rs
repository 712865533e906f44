use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::LedgerError;

pub const FREE_ORDER_PREFIX: &str = "free_order_";

static STRIPE_INTENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^pi_[A-Za-z0-9_]+$").expect("stripe intent pattern"));

static SOLANA_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{64,88}$").expect("solana signature pattern")
});

static WALLET_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("wallet address pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Stripe,
    Solana,
    Free,
}

/// A transaction signature, classified by who issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReference {
    method: PaymentMethod,
    value: String,
}

impl PaymentReference {
    pub fn parse(signature: &str) -> Result<Self, LedgerError> {
        let signature = signature.trim();

        let method = if STRIPE_INTENT.is_match(signature) {
            PaymentMethod::Stripe
        } else if signature
            .strip_prefix(FREE_ORDER_PREFIX)
            .is_some_and(|id| Uuid::parse_str(id).is_ok())
        {
            PaymentMethod::Free
        } else if SOLANA_SIGNATURE.is_match(signature) {
            PaymentMethod::Solana
        } else {
            return Err(LedgerError::InvalidReference);
        };

        Ok(Self {
            method,
            value: signature.to_string(),
        })
    }

    /// Marker for checkouts that never touch a payment rail. Batches use the batch id.
    pub fn free(id: Uuid) -> Self {
        Self {
            method: PaymentMethod::Free,
            value: format!("{FREE_ORDER_PREFIX}{id}"),
        }
    }

    pub fn method(&self) -> PaymentMethod {
        self.method
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

impl fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

pub fn is_wallet_address(address: &str) -> bool {
    WALLET_ADDRESS.is_match(address)
}
