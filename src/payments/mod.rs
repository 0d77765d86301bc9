//! Payment gateway adapter: outbound REST operations and inbound webhook
//! verification.

pub mod stripe;
pub mod webhook;

use crate::errors::ServiceError;
use crate::models::{Balance, Metadata, PaymentIntent, Payout, PayoutRequest};
use async_trait::async_trait;

pub use self::stripe::StripeClient;
pub use webhook::{GatewayEvent, WebhookVerifier};

/// Operations the fulfillment flow performs against the gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Fetches an intent with customer, payment method and charge expanded.
    async fn retrieve_intent(&self, id: &str) -> Result<PaymentIntent, ServiceError>;

    /// Merges `metadata` into the intent's metadata; keys not named are kept.
    async fn update_intent_metadata(
        &self,
        id: &str,
        metadata: Metadata,
    ) -> Result<PaymentIntent, ServiceError>;

    async fn retrieve_balance(&self) -> Result<Balance, ServiceError>;

    async fn create_payout(&self, request: PayoutRequest) -> Result<Payout, ServiceError>;

    /// Finds intents whose metadata `key` equals `value`.
    async fn search_intents_by_metadata(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<PaymentIntent>, ServiceError>;
}
