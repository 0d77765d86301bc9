use crate::errors::ServiceError;
use crate::models::SupplierShipment;
use crate::payments::webhook::SIGNATURE_HEADER;
use crate::payments::GatewayEvent;
use crate::services::FulfillmentOutcome;
use crate::AppState;
use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::future::Future;
use tracing::{debug, error, info, warn, Instrument};

type HmacSha256 = Hmac<Sha256>;

pub const SUPPLIER_SIGNATURE_HEADER: &str = "x-supplier-signature";

fn received() -> Json<Value> {
    Json(json!({ "received": true }))
}

/// Runs processing on its own task and waits up to the configured deadline.
/// The delivery is acknowledged either way; a late task keeps running.
async fn process_within_deadline<F>(state: &AppState, label: &'static str, work: F)
where
    F: Future<Output = Result<FulfillmentOutcome, ServiceError>> + Send + 'static,
{
    let work = work.instrument(tracing::Span::current());
    let task = match crate::tracing::current_request_id() {
        Some(request_id) => tokio::spawn(crate::tracing::scope_request_id(request_id, work)),
        None => tokio::spawn(work),
    };

    match tokio::time::timeout(state.config.webhook_deadline(), task).await {
        Ok(Ok(Ok(outcome))) => debug!(label, outcome = ?outcome, "delivery processed"),
        Ok(Ok(Err(e))) => error!(label, error = %e, "delivery processing failed"),
        Ok(Err(join_error)) => error!(label, error = %join_error, "delivery task aborted"),
        Err(_) => warn!(
            label,
            deadline_secs = state.config.webhook_deadline_secs,
            "processing deadline elapsed; acknowledging while work continues"
        ),
    }
}

/// `POST /webhook`: payment gateway deliveries.
///
/// Only a signature failure is answered with an error; every other branch
/// acknowledges so the gateway does not redeliver.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if let Err(e) = state.verifier.verify(signature, &body) {
        warn!(error = %e, "gateway webhook signature verification failed");
        return Err(e);
    }

    let event = match GatewayEvent::parse(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "signed delivery could not be decoded; acknowledged");
            return Ok(received());
        }
    };
    info!(event_id = %event.event_id(), event_type = %event.event_type(), "gateway event received");

    let fulfillment = state.fulfillment.clone();
    process_within_deadline(&state, "gateway", async move {
        fulfillment.handle_event(event).await
    })
    .await;

    Ok(received())
}

/// `POST /webhook/supplier`: shipment pushes for placed supplier orders.
pub async fn supplier_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    if let Some(secret) = state.config.supplier_webhook_secret.as_deref() {
        let signature = headers
            .get(SUPPLIER_SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        if let Err(e) = verify_supplier_signature(secret, signature, &body) {
            warn!(error = %e, "supplier webhook signature verification failed");
            return Err(e);
        }
    }

    let shipment: SupplierShipment = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid shipment payload: {}", e)))?;
    info!(order_id = %shipment.order_id, "supplier shipment received");

    let fulfillment = state.fulfillment.clone();
    process_within_deadline(&state, "supplier", async move {
        fulfillment.handle_supplier_shipment(shipment).await
    })
    .await;

    Ok(received())
}

/// Hex HMAC-SHA256 of the raw body.
pub fn verify_supplier_signature(
    secret: &str,
    signature: Option<&str>,
    payload: &[u8],
) -> Result<(), ServiceError> {
    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::SignatureInvalid("missing supplier signature".into()))?;
    let expected = hex::decode(signature)
        .map_err(|_| ServiceError::SignatureInvalid("supplier signature is not hex".into()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(e.to_string()))?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| ServiceError::SignatureInvalid("supplier signature mismatch".into()))
}
