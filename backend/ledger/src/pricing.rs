use serde::{Deserialize, Serialize};

use crate::LedgerError;

/// Stripe refuses to charge less than this in USD.
pub const MIN_CARD_CHARGE_CENTS: i64 = 50;

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;
const MAX_CENTS: f64 = 1e12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DiscountKind {
    Percentage(u8),
    FixedUsd(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub discount: DiscountKind,
    pub active: bool,
}

impl Coupon {
    /// Builds a coupon from its stored columns. Percentages above 100 are clamped.
    pub fn from_parts(
        code: &str,
        discount_type: &str,
        discount_value: i64,
        active: bool,
    ) -> Result<Self, LedgerError> {
        let discount = match discount_type {
            "percentage" => DiscountKind::Percentage(discount_value.clamp(0, 100) as u8),
            "fixed_usd" => DiscountKind::FixedUsd(discount_value.max(0)),
            other => return Err(LedgerError::UnknownDiscount(other.to_string())),
        };

        Ok(Self {
            code: code.to_uppercase(),
            discount,
            active,
        })
    }

    pub fn discount_for(&self, original_cents: i64) -> i64 {
        let discount = match self.discount {
            DiscountKind::Percentage(percent) => {
                let cents = (original_cents as i128 * percent as i128 + 50) / 100;
                cents.clamp(0, i64::MAX as i128) as i64
            }
            DiscountKind::FixedUsd(cents) => cents,
        };

        discount.clamp(0, original_cents.max(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub original_cents: i64,
    pub discount_cents: i64,
    pub final_cents: i64,
}

impl Quote {
    /// A coupon took off the whole, non-zero price.
    pub fn is_free(&self) -> bool {
        self.original_cents > 0 && self.discount_cents == self.original_cents
    }
}

pub fn quote(original_cents: i64, coupon: Option<&Coupon>) -> Quote {
    let original_cents = original_cents.max(0);
    let discount_cents = coupon.map_or(0, |coupon| coupon.discount_for(original_cents));

    Quote {
        original_cents,
        discount_cents,
        final_cents: original_cents - discount_cents,
    }
}

pub fn usd_to_cents(usd: f64) -> Option<i64> {
    if !usd.is_finite() || usd < 0.0 {
        return None;
    }

    let cents = (usd * 100.0).round();
    (cents < MAX_CENTS).then_some(cents as i64)
}

/// Splits a batch payment over its rows, proportionally to each row's weight.
///
/// Parts are rounded to whole lamports and the last part absorbs the rounding,
/// so the parts always add back up to `total`.
pub fn split_amount(total: f64, weights: &[i64]) -> Vec<f64> {
    if weights.is_empty() {
        return Vec::new();
    }

    let weight_sum: f64 = weights.iter().map(|w| (*w).max(0) as f64).sum();
    let mut parts = Vec::with_capacity(weights.len());
    let mut assigned = 0.0;

    for (index, weight) in weights.iter().enumerate() {
        if index == weights.len() - 1 {
            parts.push(to_lamport_precision(total - assigned));
            break;
        }

        let share = if weight_sum == 0.0 {
            1.0 / weights.len() as f64
        } else {
            (*weight).max(0) as f64 / weight_sum
        };

        let part = to_lamport_precision(total * share);
        assigned += part;
        parts.push(part);
    }

    parts
}

/// Integer version of [`split_amount`] for spreading a discount over batch lines.
pub fn split_cents(total: i64, weights: &[i64]) -> Vec<i64> {
    if weights.is_empty() {
        return Vec::new();
    }

    let weight_sum: i128 = weights.iter().map(|w| (*w).max(0) as i128).sum();
    let mut parts = Vec::with_capacity(weights.len());
    let mut assigned = 0;

    for (index, weight) in weights.iter().enumerate() {
        let part = if index == weights.len() - 1 {
            total - assigned
        } else if weight_sum == 0 {
            total / weights.len() as i64
        } else {
            // a share never exceeds `total`, only the product needs the wider type
            (total as i128 * (*weight).max(0) as i128 / weight_sum) as i64
        };

        assigned += part;
        parts.push(part);
    }

    parts
}

fn to_lamport_precision(sol: f64) -> f64 {
    (sol * LAMPORTS_PER_SOL).round() / LAMPORTS_PER_SOL
}
