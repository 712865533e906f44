use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{PaymentMethod, Quote};

pub const STRIPE_METADATA_MAX_KEYS: usize = 50;
pub const STRIPE_METADATA_KEY_LEN: usize = 40;
pub const STRIPE_METADATA_VALUE_LEN: usize = 100;

/// Pricing context stored as JSON on every order row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupon_discount: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_price: Option<i64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variant_prices: BTreeMap<String, i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
}

impl PaymentMetadata {
    pub fn from_quote(quote: &Quote, coupon_code: Option<&str>) -> Self {
        Self {
            coupon_code: coupon_code.map(str::to_string),
            coupon_discount: (quote.discount_cents > 0).then_some(quote.discount_cents),
            original_price: Some(quote.original_cents),
            final_price: Some(quote.final_cents),
            ..Default::default()
        }
    }

    /// Fields set on `other` win, variant prices are unioned.
    pub fn merge(&mut self, other: PaymentMetadata) {
        if other.payment_method.is_some() {
            self.payment_method = other.payment_method;
        }
        if other.coupon_code.is_some() {
            self.coupon_code = other.coupon_code;
        }
        if other.coupon_discount.is_some() {
            self.coupon_discount = other.coupon_discount;
        }
        if other.original_price.is_some() {
            self.original_price = other.original_price;
        }
        if other.final_price.is_some() {
            self.final_price = other.final_price;
        }
        if other.payment_intent_id.is_some() {
            self.payment_intent_id = other.payment_intent_id;
        }
        self.variant_prices.extend(other.variant_prices);
    }

    pub fn to_stripe_metadata(&self) -> BTreeMap<String, String> {
        let mut pairs = vec![
            ("couponCode".to_string(), self.coupon_code.clone().unwrap_or_default()),
            ("couponDiscount".to_string(), optional(self.coupon_discount)),
            ("originalPrice".to_string(), optional(self.original_price)),
            ("finalPrice".to_string(), optional(self.final_price)),
        ];

        pairs.extend(
            self.variant_prices
                .iter()
                .map(|(name, cents)| (format!("variant_{name}"), cents.to_string())),
        );

        stripe_metadata(pairs)
    }
}

/// Stripe metadata is a flat string map with capped key and value lengths.
pub fn stripe_metadata<I, K>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, String)>,
    K: AsRef<str>,
{
    let mut metadata = BTreeMap::new();

    for (key, value) in pairs {
        if metadata.len() == STRIPE_METADATA_MAX_KEYS {
            break;
        }

        let key = truncate(key.as_ref(), STRIPE_METADATA_KEY_LEN);
        if key.is_empty() || value.is_empty() {
            continue;
        }

        metadata.insert(key, truncate(&value, STRIPE_METADATA_VALUE_LEN));
    }

    metadata
}

fn optional(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
