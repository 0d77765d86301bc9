//! Webhook-driven fulfillment: payout verification, supplier order placement
//! and customer notification.
//!
//! All state lives in the intent's metadata. Every mutating step runs under a
//! per-intent lease and re-reads the intent first, so duplicated or reordered
//! deliveries place at most one supplier order per intent.

use crate::errors::ServiceError;
use crate::models::payment_intent::{format_usd, from_cents, keys, payout_status, TRACKING_PENDING};
use crate::models::{FulfillmentState, Metadata, PaymentIntent, Payout, PayoutRequest, SupplierShipment};
use crate::notifications::{NotificationKind, Notifier, ReceiptContext};
use crate::payments::{GatewayEvent, PaymentGateway};
use crate::services::lease::IntentLease;
use crate::services::recipient::resolve_recipient;
use crate::supplier::{OrderLine, PlacedOrder, SupplierOrders};
use metrics::counter;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What happened to the payout during the early path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutStep {
    Created { payout_id: String },
    AlreadyRecorded,
    DeferredInsufficientBalance,
    Skipped { reason: String },
    Failed { reason: String },
}

/// Result of processing one delivery. Logged, never reported to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    Fulfilled { order_id: String, notified: bool },
    EarlyPath { order_id: Option<String>, payout: PayoutStep },
    AlreadyFulfilled { order_id: String },
    InFlight,
    Uncorrelated,
    IntegrityMismatch { reason: String },
    InvalidOrder { reason: String },
    SupplierFailed { reason: String },
    FailureNotified { notified: bool },
    TrackingUpdated { intent_id: String, notified: bool },
    TrackingUnchanged,
    Ignored { event_type: String },
}

#[derive(Clone)]
pub struct FulfillmentService {
    gateway: Arc<dyn PaymentGateway>,
    supplier: Arc<dyn SupplierOrders>,
    notifier: Arc<dyn Notifier>,
    lease: Arc<dyn IntentLease>,
    map_url_template: Option<String>,
}

impl FulfillmentService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        supplier: Arc<dyn SupplierOrders>,
        notifier: Arc<dyn Notifier>,
        lease: Arc<dyn IntentLease>,
    ) -> Self {
        Self {
            gateway,
            supplier,
            notifier,
            lease,
            map_url_template: None,
        }
    }

    pub fn with_map_url_template(mut self, template: Option<String>) -> Self {
        self.map_url_template = template.filter(|t| !t.is_empty());
        self
    }

    /// Dispatches a verified gateway event.
    #[instrument(skip(self, event), fields(event_id = %event.event_id(), event_type = %event.event_type()))]
    pub async fn handle_event(&self, event: GatewayEvent) -> Result<FulfillmentOutcome, ServiceError> {
        let outcome = match event {
            GatewayEvent::PaymentIntentSucceeded { intent, .. } => {
                self.on_payment_succeeded(&intent.id).await?
            }
            GatewayEvent::PayoutPaid { payout, .. } => self.on_payout_paid(&payout).await?,
            GatewayEvent::PaymentIntentFailed { intent, .. } => {
                self.on_payment_failed(&intent).await
            }
            GatewayEvent::CheckoutSessionCompleted { session_id, .. } => {
                info!(session_id = ?session_id, "checkout session completed");
                FulfillmentOutcome::Ignored {
                    event_type: "checkout.session.completed".to_string(),
                }
            }
            GatewayEvent::Other { event_type, .. } => {
                debug!(%event_type, "event type not handled");
                FulfillmentOutcome::Ignored { event_type }
            }
        };
        info!(outcome = ?outcome, "event processed");
        Ok(outcome)
    }

    /// Early path: place the order as soon as the charge succeeds, then make
    /// sure a payout exists. Failures here are logged; `payout.paid` is the
    /// authoritative path.
    #[instrument(skip(self))]
    async fn on_payment_succeeded(&self, intent_id: &str) -> Result<FulfillmentOutcome, ServiceError> {
        let Some(lease) = self.lease.acquire(intent_id).await? else {
            info!(%intent_id, "intent busy in another delivery");
            return Ok(FulfillmentOutcome::InFlight);
        };
        let result = self.early_path_locked(intent_id).await;
        self.lease.release(lease).await;
        result
    }

    async fn early_path_locked(&self, intent_id: &str) -> Result<FulfillmentOutcome, ServiceError> {
        let intent = self.gateway.retrieve_intent(intent_id).await?;

        let order_id = match intent.fulfillment_state() {
            FulfillmentState::AwaitingPayout if intent.amount_matches_totals() => {
                self.early_order(&intent).await
            }
            FulfillmentState::AwaitingPayout => {
                warn!(%intent_id, amount = intent.amount, "charged amount does not match checkout totals; early order skipped");
                counter!("fulfillment.integrity_mismatches", 1, "check" => "amount_early");
                None
            }
            FulfillmentState::Fulfilled { order_id } => {
                debug!(%intent_id, %order_id, "already fulfilled; early order skipped");
                None
            }
            FulfillmentState::PayoutMismatch { reason } => {
                warn!(%intent_id, %reason, "intent flagged; early order skipped");
                None
            }
        };

        let payout = self.ensure_payout(&intent).await;
        Ok(FulfillmentOutcome::EarlyPath { order_id, payout })
    }

    async fn early_order(&self, intent: &PaymentIntent) -> Option<String> {
        let placed = match self.place_for_intent(intent).await {
            Ok(placed) => placed,
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "early supplier order failed");
                return None;
            }
        };
        counter!("fulfillment.orders_placed", 1, "path" => "early");

        if let Err(e) = self
            .gateway
            .update_intent_metadata(&intent.id, order_metadata(&placed))
            .await
        {
            error!(
                intent_id = %intent.id,
                order_id = %placed.order_id,
                error = %e,
                "supplier order placed but not recorded on the intent"
            );
        }
        Some(placed.order_id)
    }

    /// Creates the payout for an intent unless one is already recorded.
    async fn ensure_payout(&self, intent: &PaymentIntent) -> PayoutStep {
        if let Some(payout_id) = intent.meta(keys::PAYOUT_ID) {
            debug!(intent_id = %intent.id, %payout_id, "payout already recorded");
            return PayoutStep::AlreadyRecorded;
        }

        let amount = match intent.totals().ok().and_then(|t| t.payout_cents()) {
            Some(amount) if amount > 0 => amount,
            _ => {
                warn!(intent_id = %intent.id, "checkout totals unreadable; payout not created");
                return PayoutStep::Skipped {
                    reason: "checkout totals unreadable".to_string(),
                };
            }
        };

        let balance = match self.gateway.retrieve_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "balance lookup failed");
                return PayoutStep::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let available = balance.available_in(&intent.currency);
        if available < amount {
            info!(intent_id = %intent.id, available, amount, "insufficient available balance; payout deferred");
            let mut metadata = Metadata::new();
            metadata.insert(
                keys::PAYOUT_STATUS.to_string(),
                payout_status::DEFERRED_INSUFFICIENT_BALANCE.to_string(),
            );
            if let Err(e) = self.gateway.update_intent_metadata(&intent.id, metadata).await {
                warn!(intent_id = %intent.id, error = %e, "failed to record deferred payout");
            }
            return PayoutStep::DeferredInsufficientBalance;
        }

        let request = PayoutRequest::for_intent(&intent.id, amount, &intent.currency);
        let payout = match self.gateway.create_payout(request).await {
            Ok(payout) => payout,
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "payout creation failed");
                return PayoutStep::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let mut metadata = Metadata::new();
        metadata.insert(keys::PAYOUT_ID.to_string(), payout.id.clone());
        metadata.insert(keys::PAYOUT_STATUS.to_string(), payout_status::PENDING.to_string());
        metadata.insert(keys::EXPECTED_PAYOUT_CENTS.to_string(), amount.to_string());
        if let Err(e) = self.gateway.update_intent_metadata(&intent.id, metadata).await {
            error!(intent_id = %intent.id, payout_id = %payout.id, error = %e, "payout created but not recorded");
        }

        info!(intent_id = %intent.id, payout_id = %payout.id, amount, "payout created");
        PayoutStep::Created {
            payout_id: payout.id,
        }
    }

    /// Retries payouts deferred for lack of available balance. Returns the
    /// step taken for each intent still deferred when re-read.
    #[instrument(skip(self))]
    pub async fn retry_deferred_payouts(&self) -> Result<Vec<(String, PayoutStep)>, ServiceError> {
        let deferred = self
            .gateway
            .search_intents_by_metadata(
                keys::PAYOUT_STATUS,
                payout_status::DEFERRED_INSUFFICIENT_BALANCE,
            )
            .await?;

        let mut steps = Vec::new();
        for found in deferred {
            let Some(lease) = self.lease.acquire(&found.id).await? else {
                debug!(intent_id = %found.id, "intent busy; deferred payout left for next sweep");
                continue;
            };
            let step = match self.gateway.retrieve_intent(&found.id).await {
                Ok(intent)
                    if intent.meta(keys::PAYOUT_STATUS)
                        == Some(payout_status::DEFERRED_INSUFFICIENT_BALANCE) =>
                {
                    Some(self.ensure_payout(&intent).await)
                }
                Ok(_) => None,
                Err(e) => Some(PayoutStep::Failed {
                    reason: e.to_string(),
                }),
            };
            self.lease.release(lease).await;
            if let Some(step) = step {
                steps.push((found.id, step));
            }
        }
        Ok(steps)
    }

    /// Authoritative path: the merchant payout has landed.
    #[instrument(skip(self, payout), fields(payout_id = %payout.id, amount = payout.amount))]
    async fn on_payout_paid(&self, payout: &Payout) -> Result<FulfillmentOutcome, ServiceError> {
        let Some(intent_id) = payout.payment_intent_id() else {
            info!("payout carries no payment intent reference");
            return Ok(FulfillmentOutcome::Uncorrelated);
        };

        let Some(lease) = self.lease.acquire(intent_id).await? else {
            info!(%intent_id, "intent busy in another delivery");
            return Ok(FulfillmentOutcome::InFlight);
        };
        let result = self.payout_paid_locked(payout, intent_id).await;
        self.lease.release(lease).await;
        result
    }

    async fn payout_paid_locked(
        &self,
        payout: &Payout,
        intent_id: &str,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        let intent = self.gateway.retrieve_intent(intent_id).await?;

        if intent.expected_payout_cents() != Some(payout.amount) {
            warn!(
                %intent_id,
                expected = ?intent.expected_payout_cents(),
                received = payout.amount,
                "payout amount does not match expected payout"
            );
            return self
                .flag_mismatch(intent_id, payout_status::INCOMPLETE_PAYOUT_MISMATCH, "payout")
                .await;
        }

        if !intent.amount_matches_totals() {
            warn!(%intent_id, amount = intent.amount, "charged amount does not match checkout totals");
            return self
                .flag_mismatch(intent_id, payout_status::INCOMPLETE_AMOUNT_MISMATCH, "amount")
                .await;
        }

        if let FulfillmentState::Fulfilled { order_id } = intent.fulfillment_state() {
            if intent.is_settled() {
                info!(%intent_id, %order_id, "intent already fulfilled");
                return Ok(FulfillmentOutcome::AlreadyFulfilled { order_id });
            }
            // Placed by the early path; this is the first payout for it.
            let cost = intent
                .meta(keys::ALI_COST_USD)
                .and_then(|v| v.parse::<Decimal>().ok())
                .unwrap_or(Decimal::ZERO);
            return self.settle(intent, order_id, cost, Metadata::new()).await;
        }

        let placed = match self.place_for_intent(&intent).await {
            Ok(placed) => placed,
            Err(ServiceError::InvalidInput(reason)) => {
                warn!(%intent_id, %reason, "intent cannot be turned into a supplier order");
                return Ok(FulfillmentOutcome::InvalidOrder { reason });
            }
            Err(e) => {
                error!(%intent_id, error = %e, "supplier order placement failed");
                counter!("fulfillment.supplier_failures", 1);
                return Ok(FulfillmentOutcome::SupplierFailed {
                    reason: e.to_string(),
                });
            }
        };
        counter!("fulfillment.orders_placed", 1, "path" => "payout");

        let order_id = placed.order_id.clone();
        self.settle(intent, order_id, placed.order_cost, order_metadata(&placed))
            .await
    }

    /// Records profit and the paid payout, then sends the one success email.
    async fn settle(
        &self,
        intent: PaymentIntent,
        order_id: String,
        order_cost: Decimal,
        mut metadata: Metadata,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        let intent_id = intent.id.clone();
        let stripe_fee = match intent.processor_fee_cents() {
            Some(cents) => from_cents(cents),
            None => {
                warn!(%intent_id, "processor fee unavailable; profit excludes it");
                Decimal::ZERO
            }
        };
        let profit = from_cents(intent.amount) - stripe_fee - order_cost;

        metadata.insert(keys::STRIPE_FEE_USD.to_string(), format_usd(stripe_fee));
        metadata.insert(keys::PROFIT_USD.to_string(), format_usd(profit));
        metadata.insert(keys::PAYOUT_STATUS.to_string(), payout_status::PAID.to_string());

        if let Err(e) = self
            .gateway
            .update_intent_metadata(&intent_id, metadata.clone())
            .await
        {
            error!(
                %intent_id,
                %order_id,
                error = %e,
                "supplier order placed but not recorded on the intent"
            );
            return Err(e);
        }
        info!(%intent_id, %order_id, profit = %format_usd(profit), "intent fulfilled");

        let mut fulfilled = intent;
        fulfilled.metadata.extend(metadata);
        let notified = self.notify(NotificationKind::Success, &fulfilled).await;

        Ok(FulfillmentOutcome::Fulfilled { order_id, notified })
    }

    async fn flag_mismatch(
        &self,
        intent_id: &str,
        status: &str,
        check: &'static str,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        counter!("fulfillment.integrity_mismatches", 1, "check" => check);
        let mut metadata = Metadata::new();
        metadata.insert(keys::PAYOUT_STATUS.to_string(), status.to_string());
        self.gateway.update_intent_metadata(intent_id, metadata).await?;
        Ok(FulfillmentOutcome::IntegrityMismatch {
            reason: status.to_string(),
        })
    }

    #[instrument(skip(self, event_intent), fields(intent_id = %event_intent.id))]
    async fn on_payment_failed(&self, event_intent: &PaymentIntent) -> FulfillmentOutcome {
        // The event payload lacks expansions needed to find the customer email.
        let intent = match self.gateway.retrieve_intent(&event_intent.id).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(error = %e, "could not re-fetch failed intent; using event payload");
                event_intent.clone()
            }
        };
        let notified = self.notify(NotificationKind::Failure, &intent).await;
        FulfillmentOutcome::FailureNotified { notified }
    }

    /// Records a tracking number pushed by the supplier and tells the customer.
    #[instrument(skip(self, shipment), fields(order_id = %shipment.order_id))]
    pub async fn handle_supplier_shipment(
        &self,
        shipment: SupplierShipment,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        let Some(tracking) = shipment
            .tracking_number
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case(TRACKING_PENDING))
            .map(str::to_string)
        else {
            debug!(status = ?shipment.status, "shipment push without tracking number");
            return Ok(FulfillmentOutcome::TrackingUnchanged);
        };

        let matches = self
            .gateway
            .search_intents_by_metadata(keys::ALI_ORDER_ID, &shipment.order_id)
            .await?;
        let Some(found) = matches.into_iter().next() else {
            info!("no intent carries this supplier order");
            return Ok(FulfillmentOutcome::Uncorrelated);
        };

        let Some(lease) = self.lease.acquire(&found.id).await? else {
            return Ok(FulfillmentOutcome::InFlight);
        };
        let result = self.record_tracking_locked(&found.id, tracking).await;
        self.lease.release(lease).await;
        result
    }

    async fn record_tracking_locked(
        &self,
        intent_id: &str,
        tracking: String,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        let mut intent = self.gateway.retrieve_intent(intent_id).await?;
        if intent.tracking_number() == Some(tracking.as_str()) {
            debug!(%intent_id, "tracking number already recorded");
            return Ok(FulfillmentOutcome::TrackingUnchanged);
        }

        let mut metadata = Metadata::new();
        metadata.insert(keys::ALI_TRACKING.to_string(), tracking.clone());
        self.gateway
            .update_intent_metadata(intent_id, metadata.clone())
            .await?;
        intent.metadata.extend(metadata);
        info!(%intent_id, %tracking, "tracking number recorded");

        let notified = self.notify(NotificationKind::TrackingUpdate, &intent).await;
        Ok(FulfillmentOutcome::TrackingUpdated {
            intent_id: intent_id.to_string(),
            notified,
        })
    }

    async fn place_for_intent(&self, intent: &PaymentIntent) -> Result<PlacedOrder, ServiceError> {
        let lines: Vec<OrderLine> = intent.line_items()?.iter().map(OrderLine::from).collect();
        let shipping = intent.shipping_address()?;
        self.supplier.place_order(&lines, shipping.as_ref()).await
    }

    /// Best-effort customer email; returns whether it went out.
    async fn notify(&self, kind: NotificationKind, intent: &PaymentIntent) -> bool {
        let Some(to) = resolve_recipient(intent) else {
            warn!(intent_id = %intent.id, %kind, "no customer email on intent; notification skipped");
            return false;
        };

        let context = ReceiptContext::from_intent(intent, self.map_url_template.as_deref());
        match self.notifier.send(kind, &context, &to).await {
            Ok(()) => true,
            Err(e) => {
                counter!("fulfillment.notification_failures", 1, "kind" => kind.to_string());
                warn!(intent_id = %intent.id, %kind, error = %e, "notification failed");
                false
            }
        }
    }
}

/// Metadata describing a placed supplier order. A missing waybill is stored
/// as the pending placeholder since empty values delete keys on the gateway.
fn order_metadata(placed: &PlacedOrder) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(keys::ALI_ORDER_ID.to_string(), placed.order_id.clone());
    metadata.insert(
        keys::ALI_TRACKING.to_string(),
        placed
            .tracking_number
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| TRACKING_PENDING.to_string()),
    );
    metadata.insert(keys::ALI_COST_USD.to_string(), format_usd(placed.order_cost));
    metadata
}
