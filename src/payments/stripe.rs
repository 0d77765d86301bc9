use super::PaymentGateway;
use crate::errors::ServiceError;
use crate::models::payout::PAYMENT_INTENT_ID;
use crate::models::{Balance, Metadata, PaymentIntent, Payout, PayoutRequest};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com";

const INTENT_EXPANSIONS: [&str; 3] = [
    "customer",
    "payment_method",
    "latest_charge.balance_transaction",
];

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResult<T> {
    data: Vec<T>,
}

/// Stripe REST client over reqwest with form-encoded bodies.
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    api_base: String,
}

impl StripeClient {
    pub fn new(http: reqwest::Client, secret_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            http,
            secret_key: secret_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.api_base, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, ServiceError> {
        let response = request
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| ServiceError::PaymentGatewayError(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ServiceError::PaymentGatewayError(format!("unreadable response: {}", e)))?;

        if !status.is_success() {
            let reason = match serde_json::from_slice::<ErrorEnvelope>(&body) {
                Ok(ErrorEnvelope { error }) => format!(
                    "{} ({}): {}",
                    error.kind.as_deref().unwrap_or("api_error"),
                    error.code.as_deref().unwrap_or("no code"),
                    error.message.as_deref().unwrap_or("no message"),
                ),
                Err(_) => format!("HTTP {}", status.as_u16()),
            };
            warn!(status = status.as_u16(), %reason, "payment gateway request failed");
            return Err(ServiceError::PaymentGatewayError(reason));
        }

        serde_json::from_slice(&body)
            .map_err(|e| ServiceError::PaymentGatewayError(format!("unexpected response: {}", e)))
    }
}

/// Search query matching one metadata value, with quotes escaped.
pub fn metadata_query(key: &str, value: &str) -> String {
    format!("metadata['{}']:'{}'", key, value.replace('\'', "\\'"))
}

#[async_trait]
impl PaymentGateway for StripeClient {
    #[instrument(skip(self))]
    async fn retrieve_intent(&self, id: &str) -> Result<PaymentIntent, ServiceError> {
        let expand: Vec<(&str, &str)> = INTENT_EXPANSIONS.iter().map(|e| ("expand[]", *e)).collect();
        let request = self
            .http
            .get(self.url(&format!("/payment_intents/{}", id)))
            .query(&expand);
        self.send(request).await
    }

    #[instrument(skip(self, metadata), fields(keys = metadata.len()))]
    async fn update_intent_metadata(
        &self,
        id: &str,
        metadata: Metadata,
    ) -> Result<PaymentIntent, ServiceError> {
        let form: Vec<(String, String)> = metadata
            .into_iter()
            .map(|(k, v)| (format!("metadata[{}]", k), v))
            .collect();
        debug!(intent_id = %id, "merging intent metadata");
        let request = self
            .http
            .post(self.url(&format!("/payment_intents/{}", id)))
            .form(&form);
        self.send(request).await
    }

    async fn retrieve_balance(&self) -> Result<Balance, ServiceError> {
        self.send(self.http.get(self.url("/balance"))).await
    }

    #[instrument(skip(self, request), fields(intent_id = %request.payment_intent_id, amount = request.amount))]
    async fn create_payout(&self, request: PayoutRequest) -> Result<Payout, ServiceError> {
        let form = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.clone()),
            (
                format!("metadata[{}]", PAYMENT_INTENT_ID),
                request.payment_intent_id.clone(),
            ),
        ];
        let builder = self
            .http
            .post(self.url("/payouts"))
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form);
        self.send(builder).await
    }

    #[instrument(skip(self))]
    async fn search_intents_by_metadata(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<PaymentIntent>, ServiceError> {
        let query = metadata_query(key, value);
        let request = self
            .http
            .get(self.url("/payment_intents/search"))
            .query(&[("query", query.as_str())]);
        let result: SearchResult<PaymentIntent> = self.send(request).await?;
        Ok(result.data)
    }
}
