#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, http::Request, Router};
use chrono::Utc;
use rust_decimal_macros::dec;
use serde_json::{json, Value};

use dropship_api::{
    config::AppConfig,
    errors::ServiceError,
    models::{
        Balance, BalanceAmount, Metadata, PaymentIntent, Payout, PayoutRequest, ShippingAddress,
        SupplierToken,
    },
    notifications::{NotificationError, NotificationKind, Notifier, ReceiptContext},
    payments::{webhook::sign_header, GatewayEvent, PaymentGateway},
    services::{FulfillmentService, LocalLease},
    supplier::{
        CredentialStore, InMemoryTokenRepository, OrderLine, PlacedOrder, SupplierApp,
        SupplierOrders,
    },
    AppState,
};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret_for_fulfillment";
pub const SUPPLIER_SECRET: &str = "supplier_push_secret";
pub const CUSTOMER_EMAIL: &str = "shopper@example.com";

/// In-memory payment gateway with call counters.
#[derive(Default)]
pub struct FakeGateway {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    payouts: Mutex<Vec<PayoutRequest>>,
    available: Mutex<i64>,
    pub retrieves: AtomicUsize,
    pub updates: AtomicUsize,
    pub searches: AtomicUsize,
    pub fail_updates: AtomicBool,
}

impl FakeGateway {
    pub fn with_intent(intent: PaymentIntent) -> Self {
        let gateway = Self::default();
        gateway.insert(intent);
        gateway
    }

    pub fn insert(&self, intent: PaymentIntent) {
        self.intents
            .lock()
            .unwrap()
            .insert(intent.id.clone(), intent);
    }

    pub fn set_available(&self, cents: i64) {
        *self.available.lock().unwrap() = cents;
    }

    pub fn intent(&self, id: &str) -> PaymentIntent {
        self.intents.lock().unwrap()[id].clone()
    }

    pub fn metadata(&self, id: &str) -> Metadata {
        self.intent(id).metadata
    }

    pub fn payouts(&self) -> Vec<PayoutRequest> {
        self.payouts.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.retrieves.load(Ordering::SeqCst)
            + self.updates.load(Ordering::SeqCst)
            + self.searches.load(Ordering::SeqCst)
            + self.payouts.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn retrieve_intent(&self, id: &str) -> Result<PaymentIntent, ServiceError> {
        self.retrieves.fetch_add(1, Ordering::SeqCst);
        self.intents
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("no such payment_intent: {}", id)))
    }

    async fn update_intent_metadata(
        &self,
        id: &str,
        metadata: Metadata,
    ) -> Result<PaymentIntent, ServiceError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(ServiceError::PaymentGatewayError(
                "api_error (rate_limit): try again".into(),
            ));
        }
        assert!(
            metadata.values().all(|v| !v.is_empty()),
            "empty metadata values delete keys on the gateway"
        );
        let mut intents = self.intents.lock().unwrap();
        let intent = intents
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("no such payment_intent: {}", id)))?;
        intent.metadata.extend(metadata);
        Ok(intent.clone())
    }

    async fn retrieve_balance(&self) -> Result<Balance, ServiceError> {
        Ok(Balance {
            available: vec![BalanceAmount {
                amount: *self.available.lock().unwrap(),
                currency: "usd".into(),
            }],
            pending: vec![],
        })
    }

    async fn create_payout(&self, request: PayoutRequest) -> Result<Payout, ServiceError> {
        let mut payouts = self.payouts.lock().unwrap();
        payouts.push(request.clone());
        let mut metadata = Metadata::new();
        metadata.insert("payment_intent_id".into(), request.payment_intent_id.clone());
        Ok(Payout {
            id: format!("po_{}", payouts.len()),
            amount: request.amount,
            currency: request.currency,
            status: "pending".into(),
            metadata,
        })
    }

    async fn search_intents_by_metadata(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<PaymentIntent>, ServiceError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .intents
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.metadata.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }
}

/// Supplier that numbers its orders and can be told to fail or stall.
#[derive(Default)]
pub struct FakeSupplier {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub issue_tracking: AtomicBool,
    delay: Mutex<Option<Duration>>,
    lines: Mutex<Vec<OrderLine>>,
}

impl FakeSupplier {
    pub fn new() -> Self {
        let supplier = Self::default();
        supplier.issue_tracking.store(true, Ordering::SeqCst);
        supplier
    }

    pub fn with_delay(delay: Duration) -> Self {
        let supplier = Self::new();
        *supplier.delay.lock().unwrap() = Some(delay);
        supplier
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_lines(&self) -> Vec<OrderLine> {
        self.lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl SupplierOrders for FakeSupplier {
    async fn place_order(
        &self,
        items: &[OrderLine],
        _shipping: Option<&ShippingAddress>,
    ) -> Result<PlacedOrder, ServiceError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::SupplierError {
                code: "B_DROPSHIPPER_DELIVERY_ADDRESS_VALIDATE_FAIL".into(),
                message: "delivery address failed validation".into(),
            });
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.lines.lock().unwrap() = items.to_vec();
        Ok(PlacedOrder {
            order_id: format!("81900000{}", n),
            tracking_number: self
                .issue_tracking
                .load(Ordering::SeqCst)
                .then(|| format!("LP00{}", n)),
            order_cost: dec!(42.00),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SentEmail {
    pub kind: NotificationKind,
    pub to: String,
    pub context: ReceiptContext,
}

/// Notifier that records instead of sending.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentEmail>>,
    pub fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        kind: NotificationKind,
        context: &ReceiptContext,
        to: &str,
    ) -> Result<(), NotificationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::Rejected {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.sent.lock().unwrap().push(SentEmail {
            kind,
            to: to.to_string(),
            context: context.clone(),
        });
        Ok(())
    }
}

/// Everything a fulfillment test needs, wired around fakes.
pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub supplier: Arc<FakeSupplier>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: Arc<FulfillmentService>,
}

impl Harness {
    pub fn new(gateway: FakeGateway) -> Self {
        Self::with_supplier(gateway, FakeSupplier::new())
    }

    pub fn with_supplier(gateway: FakeGateway, supplier: FakeSupplier) -> Self {
        let gateway = Arc::new(gateway);
        let supplier = Arc::new(supplier);
        let notifier = Arc::new(RecordingNotifier::default());
        let service = Arc::new(FulfillmentService::new(
            gateway.clone(),
            supplier.clone(),
            notifier.clone(),
            Arc::new(LocalLease::new(Duration::from_secs(5))),
        ));
        Self {
            gateway,
            supplier,
            notifier,
            service,
        }
    }

    /// Router over this harness with a connected supplier account.
    pub fn router(&self, config: AppConfig) -> Router {
        let credentials = Arc::new(CredentialStore::new(
            Arc::new(InMemoryTokenRepository::with_token(SupplierToken::issued_at(
                Utc::now(),
                "access".into(),
                "refresh".into(),
                86_400,
            ))),
            reqwest::Client::new(),
            SupplierApp::new(
                config.ali_app_key.clone(),
                config.ali_app_secret.clone(),
                config.ali_api_base.clone(),
            ),
        ));
        let state = AppState::new(Arc::new(config), self.service.clone(), credentials, None);
        dropship_api::app_router(state)
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::new(
        "sqlite::memory:".into(),
        "sk_test_fulfillment".into(),
        WEBHOOK_SECRET.into(),
        "app-key-123".into(),
        "app-secret-456".into(),
        "orders@shop.example".into(),
        "test".into(),
    );
    config.webhook_deadline_secs = 5;
    config.ali_redirect_uri = Some("https://shop.example/supplier/oauth/callback".into());
    config.supplier_webhook_secret = Some(SUPPLIER_SECRET.into());
    config
}

/// Intent charged 110.51 (100.00 + 7.00 tax + 3.51 fee) with a 3.51 processor fee.
pub fn checkout_intent(id: &str) -> PaymentIntent {
    intent_from(json!({
        "id": id,
        "amount": 11051,
        "currency": "usd",
        "status": "succeeded",
        "receipt_email": CUSTOMER_EMAIL,
        "metadata": {
            "order_number": "1042",
            "subtotal": "100.00",
            "tax": "7.00",
            "fee": "3.51",
            "items": json!([
                {"id": "sku-1", "aliId": "1005001234", "title": "Desk lamp", "quantity": 2, "skuAttr": "14:193"},
                {"id": "sku-2", "aliId": 1005005678u64, "title": "Bulb", "quantity": 1}
            ]).to_string(),
            "shipping": json!({
                "name": "Ada Shopper",
                "line1": "1 Main St",
                "city": "Springfield",
                "state": "IL",
                "postal_code": "62701",
                "country": "US"
            }).to_string(),
        },
        "latest_charge": {
            "id": "ch_1",
            "billing_details": {"email": null},
            "payment_method_details": {"card": {"brand": "visa", "last4": "4242"}},
            "balance_transaction": {"id": "txn_1", "fee": 351}
        }
    }))
}

/// Same intent after the early path created its payout.
pub fn awaiting_payout_intent(id: &str) -> PaymentIntent {
    let mut intent = checkout_intent(id);
    intent
        .metadata
        .insert("expected_payout_cents".into(), "10700".into());
    intent.metadata.insert("payout_id".into(), "po_early".into());
    intent.metadata.insert("payout_status".into(), "pending".into());
    intent
}

pub fn intent_from(value: Value) -> PaymentIntent {
    serde_json::from_value(value).expect("valid intent fixture")
}

pub fn payout_for(intent_id: &str, amount: i64) -> Payout {
    let mut metadata = Metadata::new();
    metadata.insert("payment_intent_id".into(), intent_id.into());
    Payout {
        id: "po_paid_1".into(),
        amount,
        currency: "usd".into(),
        status: "paid".into(),
        metadata,
    }
}

pub fn payout_paid(intent_id: &str, amount: i64) -> GatewayEvent {
    GatewayEvent::PayoutPaid {
        event_id: "evt_payout_1".into(),
        payout: payout_for(intent_id, amount),
    }
}

pub fn payment_succeeded(intent: &PaymentIntent) -> GatewayEvent {
    GatewayEvent::PaymentIntentSucceeded {
        event_id: "evt_pi_1".into(),
        intent: intent.clone(),
    }
}

pub fn event_body(event_type: &str, object: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": "evt_http_1",
        "type": event_type,
        "data": {"object": object}
    }))
    .unwrap()
}

pub fn signed_webhook(body: Vec<u8>, secret: &str) -> Request<Body> {
    let signature = sign_header(secret, &body, Utc::now().timestamp());
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header("Stripe-Signature", signature)
        .body(Body::from(body))
        .unwrap()
}

pub fn supplier_signature(secret: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Polls until `check` passes or the budget runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
