//! Stripe webhook signatures.
//!
//! The `Stripe-Signature` header looks like `t=1700000000,v1=<hex>,v1=<hex>`. Each `v1` is an
//! HMAC-SHA256 of `"{t}.{raw body}"` keyed with the endpoint secret.
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use super::PaymentIntent;

pub const TOLERANCE_SECS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WebhookError {
    #[error("Malformed Stripe-Signature header")]
    MalformedHeader,

    #[error("Webhook timestamp outside tolerance")]
    StaleTimestamp,

    #[error("No matching signature")]
    SignatureMismatch,
}

pub fn verify_webhook_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<(), WebhookError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(WebhookError::MalformedHeader);
    }

    if now.abs_diff(timestamp) > TOLERANCE_SECS.unsigned_abs() {
        return Err(WebhookError::StaleTimestamp);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::MalformedHeader)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    let matched = signatures.iter().any(|signature| {
        hex::decode(signature).is_ok_and(|bytes| mac.clone().verify_slice(&bytes).is_ok())
    });

    if matched {
        Ok(())
    } else {
        Err(WebhookError::SignatureMismatch)
    }
}

#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: Value,
}

/// What an event means for the order carrying the intent.
///
/// A declined attempt is not final, the buyer can retry the same intent with another card.
#[derive(Debug, PartialEq, Eq)]
pub enum IntentOutcome {
    Succeeded(String),
    Canceled(String),
    Declined(String),
    Ignored,
}

impl StripeEvent {
    pub fn outcome(&self) -> Result<IntentOutcome, serde_json::Error> {
        let outcome: fn(String) -> IntentOutcome = match self.kind.as_str() {
            "payment_intent.succeeded" => IntentOutcome::Succeeded,
            "payment_intent.canceled" => IntentOutcome::Canceled,
            "payment_intent.payment_failed" => IntentOutcome::Declined,
            _ => return Ok(IntentOutcome::Ignored),
        };

        let intent: PaymentIntent = serde_json::from_value(self.data.object.clone())?;

        Ok(outcome(intent.id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";
    const NOW: i64 = 1_700_000_000;

    pub(crate) fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);

        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature() {
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign(payload, SECRET, NOW);

        assert_eq!(verify_webhook_signature(payload, &header, SECRET, NOW + 10), Ok(()));
    }

    #[test]
    fn test_wrong_secret() {
        let payload = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign(payload, "wrong_secret", NOW);

        assert_eq!(
            verify_webhook_signature(payload, &header, SECRET, NOW),
            Err(WebhookError::SignatureMismatch)
        );
    }

    #[test]
    fn test_modified_payload() {
        let header = sign(br#"{"amount":100}"#, SECRET, NOW);

        assert_eq!(
            verify_webhook_signature(br#"{"amount":999}"#, &header, SECRET, NOW),
            Err(WebhookError::SignatureMismatch)
        );
    }

    #[test]
    fn test_old_timestamp() {
        let payload = b"{}";
        let header = sign(payload, SECRET, NOW - 600);

        assert_eq!(
            verify_webhook_signature(payload, &header, SECRET, NOW),
            Err(WebhookError::StaleTimestamp)
        );
    }

    #[test]
    fn test_extreme_timestamps() {
        for timestamp in [i64::MIN, i64::MAX] {
            let header = sign(b"{}", SECRET, timestamp);
            assert_eq!(
                verify_webhook_signature(b"{}", &header, SECRET, NOW),
                Err(WebhookError::StaleTimestamp)
            );
        }

        assert_eq!(
            verify_webhook_signature(b"{}", "t=-9223372036854775808,v1=00", SECRET, NOW),
            Err(WebhookError::StaleTimestamp)
        );
    }

    #[test]
    fn test_any_of_several_signatures() {
        let payload = b"{}";
        let good = sign(payload, SECRET, NOW);
        let header = format!("t={NOW},v1=deadbeef,{}", good.split_once(',').unwrap().1);

        assert_eq!(verify_webhook_signature(payload, &header, SECRET, NOW), Ok(()));
    }

    #[test]
    fn test_malformed_headers() {
        for header in ["", "garbage", "v1=abc", "t=1700000000", "t=soon,v1=abc"] {
            assert_eq!(
                verify_webhook_signature(b"{}", header, SECRET, NOW),
                Err(WebhookError::MalformedHeader),
                "{header}"
            );
        }
    }

    #[test]
    fn test_event_outcomes() {
        let event = |kind: &str| StripeEvent {
            id: "evt_1".into(),
            kind: kind.into(),
            data: EventData {
                object: serde_json::json!({ "id": "pi_1", "status": "succeeded", "amount": 100 }),
            },
        };

        assert_eq!(
            event("payment_intent.succeeded").outcome().unwrap(),
            IntentOutcome::Succeeded("pi_1".into())
        );
        assert_eq!(
            event("payment_intent.canceled").outcome().unwrap(),
            IntentOutcome::Canceled("pi_1".into())
        );
        assert_eq!(
            event("payment_intent.payment_failed").outcome().unwrap(),
            IntentOutcome::Declined("pi_1".into())
        );
        assert_eq!(event("charge.refunded").outcome().unwrap(), IntentOutcome::Ignored);
    }
}
