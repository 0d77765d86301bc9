use super::payment_intent::Metadata;
use serde::{Deserialize, Serialize};

/// Metadata key carrying the back-reference to the intent a payout settles.
pub const PAYMENT_INTENT_ID: &str = "payment_intent_id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: String,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Payout {
    pub fn payment_intent_id(&self) -> Option<&str> {
        self.metadata
            .get(PAYMENT_INTENT_ID)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceAmount {
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    #[serde(default)]
    pub available: Vec<BalanceAmount>,
    #[serde(default)]
    pub pending: Vec<BalanceAmount>,
}

impl Balance {
    pub fn available_in(&self, currency: &str) -> i64 {
        self.available
            .iter()
            .filter(|b| b.currency.eq_ignore_ascii_case(currency))
            .map(|b| b.amount)
            .sum()
    }
}

/// Parameters for creating a payout tied to one intent.
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub amount: i64,
    pub currency: String,
    pub payment_intent_id: String,
    pub idempotency_key: String,
}

impl PayoutRequest {
    pub fn for_intent(intent_id: &str, amount: i64, currency: &str) -> Self {
        Self {
            amount,
            currency: currency.to_lowercase(),
            payment_intent_id: intent_id.to_string(),
            idempotency_key: format!("payout-{}", intent_id),
        }
    }
}
