//! Payment intent as returned by the payment gateway, plus the typed view of
//! the fulfillment state it carries in its flat string metadata.

use crate::errors::ServiceError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Flat string metadata stored on the intent.
pub type Metadata = BTreeMap<String, String>;

/// Metadata keys read and written by the fulfillment flow.
pub mod keys {
    pub const ORDER_NUMBER: &str = "order_number";
    pub const SUBTOTAL: &str = "subtotal";
    pub const TAX: &str = "tax";
    pub const FEE: &str = "fee";
    pub const ITEMS: &str = "items";
    pub const SHIPPING: &str = "shipping";
    pub const ALI_ORDER_ID: &str = "ali_order_id";
    pub const ALI_TRACKING: &str = "ali_tracking";
    pub const ALI_COST_USD: &str = "ali_cost_usd";
    pub const STRIPE_FEE_USD: &str = "stripe_fee_usd";
    pub const PROFIT_USD: &str = "profit_usd";
    pub const PAYOUT_ID: &str = "payout_id";
    pub const PAYOUT_STATUS: &str = "payout_status";
    pub const EXPECTED_PAYOUT_CENTS: &str = "expected_payout_cents";
}

/// Values written to `payout_status`.
pub mod payout_status {
    pub const PENDING: &str = "pending";
    pub const PAID: &str = "paid";
    pub const DEFERRED_INSUFFICIENT_BALANCE: &str = "deferred_insufficient_balance";
    pub const INCOMPLETE_PAYOUT_MISMATCH: &str = "incomplete_payout_mismatch";
    pub const INCOMPLETE_AMOUNT_MISMATCH: &str = "incomplete_amount_mismatch";
    pub const INCOMPLETE_PREFIX: &str = "incomplete_";
}

/// Placeholder stored while the supplier has not issued a waybill.
pub const TRACKING_PENDING: &str = "PENDING";

/// A reference the gateway returns either as a bare id or as the expanded object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl<T> Expandable<T> {
    pub fn as_object(&self) -> Option<&T> {
        match self {
            Expandable::Id(_) => None,
            Expandable::Object(obj) => Some(obj),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingDetails {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardDetails {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub last4: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    #[serde(default)]
    pub billing_details: BillingDetails,
    #[serde(default)]
    pub card: Option<CardDetails>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentMethodDetails {
    #[serde(default)]
    pub card: Option<CardDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceTransaction {
    pub id: String,
    /// Processor fee in minor units
    pub fee: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    #[serde(default)]
    pub billing_details: BillingDetails,
    #[serde(default)]
    pub payment_method_details: Option<PaymentMethodDetails>,
    #[serde(default)]
    pub balance_transaction: Option<Expandable<BalanceTransaction>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastPaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub decline_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub receipt_email: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable<Customer>>,
    #[serde(default)]
    pub payment_method: Option<Expandable<PaymentMethod>>,
    #[serde(default)]
    pub latest_charge: Option<Expandable<Charge>>,
    #[serde(default)]
    pub last_payment_error: Option<LastPaymentError>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// One line of `metadata.items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Supplier product id
    #[serde(rename = "aliId", deserialize_with = "string_or_number")]
    pub ali_id: String,
    #[serde(default)]
    pub title: String,
    pub quantity: u32,
    #[serde(rename = "skuAttr", default)]
    pub sku_attr: Option<String>,
}

/// Shipping address captured at checkout (`metadata.shipping`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingAddress {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(alias = "address1", alias = "address")]
    pub line1: String,
    #[serde(default, alias = "address2")]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default, alias = "province")]
    pub state: String,
    #[serde(alias = "zip", alias = "postalCode")]
    pub postal_code: String,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_country() -> String {
    "US".to_string()
}

impl ShippingAddress {
    /// Single-line form used in email and map lookups.
    pub fn one_line(&self) -> String {
        let mut parts = vec![self.line1.clone()];
        if let Some(line2) = self.line2.as_deref().filter(|l| !l.is_empty()) {
            parts.push(line2.to_string());
        }
        parts.push(self.city.clone());
        parts.push(format!("{} {}", self.state, self.postal_code).trim().to_string());
        parts.push(self.country.clone());
        parts.retain(|p| !p.is_empty());
        parts.join(", ")
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Dollar amounts recorded at checkout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub fee: Decimal,
}

impl OrderTotals {
    /// What the customer should have been charged, in minor units.
    pub fn charged_cents(&self) -> Option<i64> {
        to_cents(self.subtotal + self.tax + self.fee)
    }

    /// What the merchant payout should carry: the fee covers processing costs.
    pub fn payout_cents(&self) -> Option<i64> {
        to_cents(self.subtotal + self.tax)
    }
}

/// Converts dollars to minor units, rounding half away from zero.
pub fn to_cents(amount: Decimal) -> Option<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Formats a dollar amount with two decimals for metadata.
pub fn format_usd(amount: Decimal) -> String {
    format!(
        "{:.2}",
        amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    )
}

/// Fulfillment progress reconstructed from metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentState {
    AwaitingPayout,
    PayoutMismatch { reason: String },
    Fulfilled { order_id: String },
}

impl PaymentIntent {
    /// Metadata value, treating empty strings as absent.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn order_number(&self) -> Option<&str> {
        self.meta(keys::ORDER_NUMBER)
    }

    pub fn fulfillment_state(&self) -> FulfillmentState {
        if let Some(order_id) = self.meta(keys::ALI_ORDER_ID) {
            return FulfillmentState::Fulfilled {
                order_id: order_id.to_string(),
            };
        }
        match self.meta(keys::PAYOUT_STATUS) {
            Some(status) if status.starts_with(payout_status::INCOMPLETE_PREFIX) => {
                FulfillmentState::PayoutMismatch {
                    reason: status.to_string(),
                }
            }
            _ => FulfillmentState::AwaitingPayout,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self.fulfillment_state(), FulfillmentState::Fulfilled { .. })
    }

    /// Profit is written once, when the paid payout is matched to the order.
    /// Later status rewrites do not clear it.
    pub fn is_settled(&self) -> bool {
        self.is_fulfilled() && self.meta(keys::PROFIT_USD).is_some()
    }

    pub fn totals(&self) -> Result<OrderTotals, ServiceError> {
        let parse = |key: &str| -> Result<Decimal, ServiceError> {
            let raw = self
                .meta(key)
                .ok_or_else(|| ServiceError::InvalidInput(format!("metadata.{} missing", key)))?;
            Decimal::from_str(raw.trim()).map_err(|e| {
                ServiceError::InvalidInput(format!("metadata.{} is not a number: {}", key, e))
            })
        };
        Ok(OrderTotals {
            subtotal: parse(keys::SUBTOTAL)?,
            tax: parse(keys::TAX)?,
            fee: parse(keys::FEE)?,
        })
    }

    /// `round((subtotal + tax + fee) * 100) == amount`; unreadable totals never match.
    pub fn amount_matches_totals(&self) -> bool {
        self.totals()
            .ok()
            .and_then(|t| t.charged_cents())
            .map_or(false, |cents| cents == self.amount)
    }

    pub fn expected_payout_cents(&self) -> Option<i64> {
        self.meta(keys::EXPECTED_PAYOUT_CENTS)
            .and_then(|v| v.trim().parse::<i64>().ok())
    }

    pub fn line_items(&self) -> Result<Vec<LineItem>, ServiceError> {
        let raw = self
            .meta(keys::ITEMS)
            .ok_or_else(|| ServiceError::InvalidInput("metadata.items missing".to_string()))?;
        serde_json::from_str(raw)
            .map_err(|e| ServiceError::InvalidInput(format!("metadata.items is malformed: {}", e)))
    }

    pub fn shipping_address(&self) -> Result<Option<ShippingAddress>, ServiceError> {
        match self.meta(keys::SHIPPING) {
            None | Some("null") => Ok(None),
            Some(raw) => serde_json::from_str(raw).map(Some).map_err(|e| {
                ServiceError::InvalidInput(format!("metadata.shipping is malformed: {}", e))
            }),
        }
    }

    /// Tracking number, if the supplier has issued one.
    pub fn tracking_number(&self) -> Option<&str> {
        self.meta(keys::ALI_TRACKING)
            .filter(|t| !t.eq_ignore_ascii_case(TRACKING_PENDING))
    }

    pub fn charge(&self) -> Option<&Charge> {
        self.latest_charge.as_ref().and_then(Expandable::as_object)
    }

    /// Processor fee taken from the charge's balance transaction.
    pub fn processor_fee_cents(&self) -> Option<i64> {
        self.charge()
            .and_then(|c| c.balance_transaction.as_ref())
            .and_then(Expandable::as_object)
            .map(|bt| bt.fee)
    }

    /// Card brand and last four digits, from the payment method or the charge.
    pub fn card(&self) -> Option<CardDetails> {
        let from_method = self
            .payment_method
            .as_ref()
            .and_then(Expandable::as_object)
            .and_then(|pm| pm.card.clone());
        let from_charge = || {
            self.charge()
                .and_then(|c| c.payment_method_details.as_ref())
                .and_then(|d| d.card.clone())
        };
        from_method
            .or_else(from_charge)
            .filter(|c| c.last4.is_some() || c.brand.is_some())
    }
}
