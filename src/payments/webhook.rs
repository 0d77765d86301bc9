//! Inbound gateway deliveries: signature verification and event decoding.

use crate::errors::ServiceError;
use crate::models::{PaymentIntent, Payout};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Verifies `Stripe-Signature: t=<unix>,v1=<hex>[,v1=...]` headers.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: u64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, header: Option<&str>, payload: &[u8]) -> Result<(), ServiceError> {
        self.verify_at(header, payload, chrono::Utc::now().timestamp())
    }

    pub fn verify_at(&self, header: Option<&str>, payload: &[u8], now: i64) -> Result<(), ServiceError> {
        let header = header
            .ok_or_else(|| ServiceError::SignatureInvalid("missing Stripe-Signature header".into()))?;

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| ServiceError::SignatureInvalid("no timestamp in signature header".into()))?;
        if signatures.is_empty() {
            return Err(ServiceError::SignatureInvalid("no v1 signature in header".into()));
        }
        if now.abs_diff(timestamp) > self.tolerance_secs {
            return Err(ServiceError::SignatureInvalid(
                "timestamp outside the tolerance zone".into(),
            ));
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);

        let matched = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });
        if matched {
            Ok(())
        } else {
            Err(ServiceError::SignatureInvalid(
                "no signature matches the payload".into(),
            ))
        }
    }

    /// Header value for a payload, as the gateway would send it.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        sign_header(&self.secret, payload, timestamp)
    }
}

pub fn sign_header(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

/// Event types the fulfillment flow reacts to.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    PaymentIntentSucceeded { event_id: String, intent: PaymentIntent },
    PaymentIntentFailed { event_id: String, intent: PaymentIntent },
    PayoutPaid { event_id: String, payout: Payout },
    CheckoutSessionCompleted { event_id: String, session_id: Option<String> },
    Other { event_id: String, event_type: String },
}

impl GatewayEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ServiceError> {
        let raw: RawEvent = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::BadRequest(format!("invalid event envelope: {}", e)))?;
        let object = raw.data.object;
        let event_id = raw.id;

        let event = match raw.event_type.as_str() {
            "payment_intent.succeeded" => GatewayEvent::PaymentIntentSucceeded {
                event_id,
                intent: decode(object, "payment intent")?,
            },
            "payment_intent.payment_failed" => GatewayEvent::PaymentIntentFailed {
                event_id,
                intent: decode(object, "payment intent")?,
            },
            "payout.paid" => GatewayEvent::PayoutPaid {
                event_id,
                payout: decode(object, "payout")?,
            },
            "checkout.session.completed" => GatewayEvent::CheckoutSessionCompleted {
                event_id,
                session_id: object.get("id").and_then(Value::as_str).map(str::to_string),
            },
            _ => GatewayEvent::Other {
                event_id,
                event_type: raw.event_type,
            },
        };
        Ok(event)
    }

    pub fn event_id(&self) -> &str {
        match self {
            GatewayEvent::PaymentIntentSucceeded { event_id, .. }
            | GatewayEvent::PaymentIntentFailed { event_id, .. }
            | GatewayEvent::PayoutPaid { event_id, .. }
            | GatewayEvent::CheckoutSessionCompleted { event_id, .. }
            | GatewayEvent::Other { event_id, .. } => event_id,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            GatewayEvent::PaymentIntentSucceeded { .. } => "payment_intent.succeeded",
            GatewayEvent::PaymentIntentFailed { .. } => "payment_intent.payment_failed",
            GatewayEvent::PayoutPaid { .. } => "payout.paid",
            GatewayEvent::CheckoutSessionCompleted { .. } => "checkout.session.completed",
            GatewayEvent::Other { event_type, .. } => event_type,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(object: Value, what: &str) -> Result<T, ServiceError> {
    serde_json::from_value(object)
        .map_err(|e| ServiceError::BadRequest(format!("invalid {} object: {}", what, e)))
}
