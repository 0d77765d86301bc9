//! Transactional customer email.

pub mod email;
pub mod mail_api;

use crate::errors::ServiceError;
use crate::models::payment_intent::from_cents;
use crate::models::{CardDetails, OrderTotals, PaymentIntent, ShippingAddress};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use email::{EmailComposer, EmailMessage};
pub use mail_api::{LogNotifier, MailApiNotifier};

/// Kinds of customer email
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NotificationKind {
    Success,
    Failure,
    TrackingUpdate,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Mail transport error: {0}")]
    Transport(String),
    #[error("Mail API rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

impl From<NotificationError> for ServiceError {
    fn from(err: NotificationError) -> Self {
        ServiceError::NotificationError(err.to_string())
    }
}

/// Sends one email per call. Callers decide about retries.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        kind: NotificationKind,
        context: &ReceiptContext,
        to: &str,
    ) -> Result<(), NotificationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptLine {
    pub title: String,
    pub quantity: u32,
}

/// Everything an email may show about a purchase. All enrichment is optional.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiptContext {
    pub intent_id: String,
    pub order_number: Option<String>,
    pub customer_name: Option<String>,
    pub items: Vec<ReceiptLine>,
    pub totals: Option<ReceiptTotals>,
    /// Dollars
    pub amount_charged: Decimal,
    pub currency: String,
    pub shipping: Option<ShippingAddress>,
    pub card: Option<CardDetails>,
    pub tracking_number: Option<String>,
    pub map_url: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReceiptTotals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub fee: Decimal,
}

impl From<OrderTotals> for ReceiptTotals {
    fn from(t: OrderTotals) -> Self {
        Self {
            subtotal: t.subtotal,
            tax: t.tax,
            fee: t.fee,
        }
    }
}

impl ReceiptContext {
    /// Builds the context from an intent, skipping anything unreadable.
    pub fn from_intent(intent: &PaymentIntent, map_url_template: Option<&str>) -> Self {
        let shipping = intent.shipping_address().ok().flatten();
        let map_url = match (map_url_template, &shipping) {
            (Some(template), Some(address)) => Some(map_url(template, address)),
            _ => None,
        };
        let items = intent
            .line_items()
            .map(|items| {
                items
                    .into_iter()
                    .map(|i| ReceiptLine {
                        title: i.title,
                        quantity: i.quantity,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let failure_reason = intent
            .last_payment_error
            .as_ref()
            .and_then(|e| e.message.clone().or_else(|| e.decline_code.clone()));
        let customer_name = shipping
            .as_ref()
            .map(|s| s.name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| intent.charge().and_then(|c| c.billing_details.name.clone()));

        Self {
            intent_id: intent.id.clone(),
            order_number: intent.order_number().map(str::to_string),
            customer_name,
            items,
            totals: intent.totals().ok().map(ReceiptTotals::from),
            amount_charged: from_cents(intent.amount),
            currency: intent.currency.to_uppercase(),
            shipping,
            card: intent.card(),
            tracking_number: intent.tracking_number().map(str::to_string),
            map_url,
            failure_reason,
        }
    }

    /// Label used in subjects: the merchant order number, else the intent id.
    pub fn reference(&self) -> &str {
        self.order_number.as_deref().unwrap_or(&self.intent_id)
    }
}

/// Expands `{address}` in the template with the url-encoded one-line address.
pub fn map_url(template: &str, address: &ShippingAddress) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(address.one_line().as_bytes()).collect();
    template.replace("{address}", &encoded)
}
