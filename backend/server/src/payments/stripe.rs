use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{info, warn};

use super::{CreateIntent, PaymentError, PaymentIntent, PaymentProvider};

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
    code: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

pub struct StripeClient {
    client: Client,
    secret_key: String,
    api_base: String,
}

impl StripeClient {
    pub fn new(secret_key: &str, api_base: &str) -> Self {
        Self {
            client: Client::new(),
            secret_key: secret_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn intents_url(&self) -> String {
        format!("{}/v1/payment_intents", self.api_base)
    }
}

fn form_fields(intent: &CreateIntent) -> Vec<(String, String)> {
    let mut fields = vec![
        ("amount".to_string(), intent.amount_cents.to_string()),
        ("currency".to_string(), intent.currency.clone()),
        ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
    ];

    if let Some(description) = &intent.description {
        fields.push(("description".to_string(), description.clone()));
    }
    if let Some(email) = &intent.receipt_email {
        fields.push(("receipt_email".to_string(), email.clone()));
    }

    fields.extend(
        intent
            .metadata
            .iter()
            .map(|(key, value)| (format!("metadata[{key}]"), value.clone())),
    );

    fields
}

async fn parse_intent(response: Response) -> Result<PaymentIntent, PaymentError> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(|e| PaymentError::Decode(e.to_string()));
    }

    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody { error }) => {
            warn!(
                %status,
                kind = error.kind.as_deref().unwrap_or("unknown"),
                code = error.code.as_deref().unwrap_or("none"),
                "Stripe request failed"
            );

            Err(PaymentError::Stripe {
                message: error.message.unwrap_or_else(|| status.to_string()),
                code: error.code,
            })
        }
        Err(_) => Err(PaymentError::Decode(format!("{status}: {body}"))),
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_payment_intent(&self, intent: CreateIntent) -> Result<PaymentIntent, PaymentError> {
        let mut request = self
            .client
            .post(self.intents_url())
            .bearer_auth(&self.secret_key)
            .form(&form_fields(&intent));

        if let Some(key) = &intent.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let created = parse_intent(request.send().await?).await?;
        info!(payment_intent_id = %created.id, amount = created.amount, "Created payment intent");

        Ok(created)
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, PaymentError> {
        let response = self
            .client
            .get(format!("{}/{id}", self.intents_url()))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;

        parse_intent(response).await
    }
}
