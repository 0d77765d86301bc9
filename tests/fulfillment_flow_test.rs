mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use common::*;
use serde_json::json;

use dropship_api::models::SupplierShipment;
use dropship_api::notifications::NotificationKind;
use dropship_api::payments::GatewayEvent;
use dropship_api::services::{FulfillmentOutcome, PayoutStep};

#[tokio::test]
async fn payout_paid_places_one_order_and_records_profit() {
    let h = Harness::new(FakeGateway::with_intent(awaiting_payout_intent("pi_happy")));

    let outcome = h
        .service
        .handle_event(payout_paid("pi_happy", 10700))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FulfillmentOutcome::Fulfilled {
            order_id: "819000001".into(),
            notified: true
        }
    );
    assert_eq!(h.supplier.calls(), 1);

    let metadata = h.gateway.metadata("pi_happy");
    assert_eq!(metadata["ali_order_id"], "819000001");
    assert_eq!(metadata["ali_tracking"], "LP001");
    assert_eq!(metadata["ali_cost_usd"], "42.00");
    assert_eq!(metadata["stripe_fee_usd"], "3.51");
    assert_eq!(metadata["profit_usd"], "65.00");
    assert_eq!(metadata["payout_status"], "paid");
    // checkout keys survive the merge
    assert_eq!(metadata["order_number"], "1042");

    let lines = h.supplier.last_lines();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].product_id, "1005001234");
    assert_eq!(lines[0].quantity, 2);
    assert_eq!(lines[0].sku_attr.as_deref(), Some("14:193"));
    assert_eq!(lines[1].product_id, "1005005678");
    assert_eq!(lines[1].sku_attr, None);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Success);
    assert_eq!(sent[0].to, CUSTOMER_EMAIL);
    assert_eq!(sent[0].context.order_number.as_deref(), Some("1042"));
    assert_eq!(sent[0].context.tracking_number.as_deref(), Some("LP001"));
    assert_eq!(
        sent[0].context.card.as_ref().and_then(|c| c.last4.as_deref()),
        Some("4242")
    );
}

#[tokio::test]
async fn redelivered_payout_places_exactly_one_order() {
    let h = Harness::new(FakeGateway::with_intent(awaiting_payout_intent("pi_dup")));

    let first = h
        .service
        .handle_event(payout_paid("pi_dup", 10700))
        .await
        .unwrap();
    assert_matches!(first, FulfillmentOutcome::Fulfilled { .. });

    for _ in 0..4 {
        let again = h
            .service
            .handle_event(payout_paid("pi_dup", 10700))
            .await
            .unwrap();
        assert_eq!(
            again,
            FulfillmentOutcome::AlreadyFulfilled {
                order_id: "819000001".into()
            }
        );
    }

    assert_eq!(h.supplier.calls(), 1);
    assert_eq!(h.notifier.sent().len(), 1);
    assert_eq!(h.gateway.metadata("pi_dup")["ali_order_id"], "819000001");
}

#[tokio::test]
async fn concurrent_payout_deliveries_are_serialized() {
    let h = Harness::with_supplier(
        FakeGateway::with_intent(awaiting_payout_intent("pi_race")),
        FakeSupplier::with_delay(Duration::from_millis(50)),
    );

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = h.service.clone();
            tokio::spawn(async move { service.handle_event(payout_paid("pi_race", 10700)).await })
        })
        .collect();

    let mut fulfilled = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            FulfillmentOutcome::Fulfilled { .. } => fulfilled += 1,
            FulfillmentOutcome::AlreadyFulfilled { order_id } => assert_eq!(order_id, "819000001"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(fulfilled, 1);
    assert_eq!(h.supplier.calls(), 1);
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn stray_payout_after_fulfillment_does_not_resend_email() {
    let h = Harness::new(FakeGateway::with_intent(awaiting_payout_intent("pi_stray")));

    let first = h
        .service
        .handle_event(payout_paid("pi_stray", 10700))
        .await
        .unwrap();
    assert_matches!(first, FulfillmentOutcome::Fulfilled { .. });

    let stray = h
        .service
        .handle_event(payout_paid("pi_stray", 500))
        .await
        .unwrap();
    assert_matches!(stray, FulfillmentOutcome::IntegrityMismatch { .. });

    let redelivered = h
        .service
        .handle_event(payout_paid("pi_stray", 10700))
        .await
        .unwrap();
    assert_eq!(
        redelivered,
        FulfillmentOutcome::AlreadyFulfilled {
            order_id: "819000001".into()
        }
    );

    assert_eq!(h.supplier.calls(), 1);
    assert_eq!(h.notifier.sent().len(), 1);
    assert_eq!(h.gateway.metadata("pi_stray")["profit_usd"], "65.00");
}

#[tokio::test]
async fn payout_amount_mismatch_blocks_the_order() {
    let h = Harness::new(FakeGateway::with_intent(awaiting_payout_intent("pi_short")));

    let outcome = h
        .service
        .handle_event(payout_paid("pi_short", 10699))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FulfillmentOutcome::IntegrityMismatch {
            reason: "incomplete_payout_mismatch".into()
        }
    );
    let metadata = h.gateway.metadata("pi_short");
    assert_eq!(metadata["payout_status"], "incomplete_payout_mismatch");
    assert!(!metadata.contains_key("ali_order_id"));
    assert_eq!(h.supplier.calls(), 0);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn payout_without_expected_amount_is_a_mismatch() {
    let h = Harness::new(FakeGateway::with_intent(checkout_intent("pi_noexp")));

    let outcome = h
        .service
        .handle_event(payout_paid("pi_noexp", 10700))
        .await
        .unwrap();

    assert_matches!(outcome, FulfillmentOutcome::IntegrityMismatch { .. });
    assert_eq!(
        h.gateway.metadata("pi_noexp")["payout_status"],
        "incomplete_payout_mismatch"
    );
    assert_eq!(h.supplier.calls(), 0);
}

#[tokio::test]
async fn charged_amount_mismatch_blocks_the_order() {
    let mut intent = awaiting_payout_intent("pi_tampered");
    intent.amount = 11000;
    let h = Harness::new(FakeGateway::with_intent(intent));

    let outcome = h
        .service
        .handle_event(payout_paid("pi_tampered", 10700))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FulfillmentOutcome::IntegrityMismatch {
            reason: "incomplete_amount_mismatch".into()
        }
    );
    assert_eq!(
        h.gateway.metadata("pi_tampered")["payout_status"],
        "incomplete_amount_mismatch"
    );
    assert_eq!(h.supplier.calls(), 0);
}

#[tokio::test]
async fn payout_without_intent_reference_is_ignored() {
    let h = Harness::new(FakeGateway::default());
    let mut payout = payout_for("pi_x", 10700);
    payout.metadata.clear();

    let outcome = h
        .service
        .handle_event(GatewayEvent::PayoutPaid {
            event_id: "evt_manual".into(),
            payout,
        })
        .await
        .unwrap();

    assert_eq!(outcome, FulfillmentOutcome::Uncorrelated);
    assert_eq!(h.gateway.total_calls(), 0);
}

#[tokio::test]
async fn supplier_failure_leaves_intent_retryable() {
    let h = Harness::new(FakeGateway::with_intent(awaiting_payout_intent("pi_retry")));
    h.supplier.fail.store(true, Ordering::SeqCst);

    let failed = h
        .service
        .handle_event(payout_paid("pi_retry", 10700))
        .await
        .unwrap();
    assert_matches!(failed, FulfillmentOutcome::SupplierFailed { reason } if reason.contains("B_DROPSHIPPER"));
    assert!(!h.gateway.metadata("pi_retry").contains_key("ali_order_id"));
    assert!(h.notifier.sent().is_empty());

    h.supplier.fail.store(false, Ordering::SeqCst);
    let retried = h
        .service
        .handle_event(payout_paid("pi_retry", 10700))
        .await
        .unwrap();
    assert_matches!(retried, FulfillmentOutcome::Fulfilled { .. });
    assert_eq!(h.supplier.calls(), 1);
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn missing_waybill_is_recorded_as_pending() {
    let h = Harness::new(FakeGateway::with_intent(awaiting_payout_intent("pi_nowaybill")));
    h.supplier.issue_tracking.store(false, Ordering::SeqCst);

    h.service
        .handle_event(payout_paid("pi_nowaybill", 10700))
        .await
        .unwrap();

    assert_eq!(h.gateway.metadata("pi_nowaybill")["ali_tracking"], "PENDING");
    assert_eq!(h.notifier.sent()[0].context.tracking_number, None);
}

#[tokio::test]
async fn notification_failure_keeps_the_fulfillment() {
    let h = Harness::new(FakeGateway::with_intent(awaiting_payout_intent("pi_mailfail")));
    h.notifier.fail.store(true, Ordering::SeqCst);

    let outcome = h
        .service
        .handle_event(payout_paid("pi_mailfail", 10700))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FulfillmentOutcome::Fulfilled {
            order_id: "819000001".into(),
            notified: false
        }
    );
    assert_eq!(h.gateway.metadata("pi_mailfail")["payout_status"], "paid");
}

#[tokio::test]
async fn unrecorded_order_surfaces_as_error() {
    let h = Harness::new(FakeGateway::with_intent(awaiting_payout_intent("pi_nowrite")));
    h.gateway.fail_updates.store(true, Ordering::SeqCst);

    let result = h
        .service
        .handle_event(payout_paid("pi_nowrite", 10700))
        .await;

    assert!(result.is_err());
    assert_eq!(h.supplier.calls(), 1);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn recipient_falls_back_to_charge_billing_email() {
    let mut intent = awaiting_payout_intent("pi_fallback");
    intent.receipt_email = None;
    let mut value = serde_json::to_value(&intent).unwrap();
    value["customer"] = json!({"id": "cus_1", "deleted": true});
    value["payment_method"] = json!({"id": "pm_1", "billing_details": {"email": null}});
    value["latest_charge"]["billing_details"]["email"] = json!("a@x.com");
    let h = Harness::new(FakeGateway::with_intent(intent_from(value)));

    h.service
        .handle_event(payout_paid("pi_fallback", 10700))
        .await
        .unwrap();

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "a@x.com");
}

#[tokio::test]
async fn fulfillment_without_any_email_skips_notification() {
    let mut intent = awaiting_payout_intent("pi_anon");
    intent.receipt_email = None;
    let h = Harness::new(FakeGateway::with_intent(intent));

    let outcome = h
        .service
        .handle_event(payout_paid("pi_anon", 10700))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FulfillmentOutcome::Fulfilled {
            order_id: "819000001".into(),
            notified: false
        }
    );
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn early_path_orders_and_creates_the_payout() {
    let intent = checkout_intent("pi_early");
    let h = Harness::new(FakeGateway::with_intent(intent.clone()));
    h.gateway.set_available(50_000);

    let outcome = h
        .service
        .handle_event(payment_succeeded(&intent))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FulfillmentOutcome::EarlyPath {
            order_id: Some("819000001".into()),
            payout: PayoutStep::Created {
                payout_id: "po_1".into()
            },
        }
    );
    let payouts = h.gateway.payouts();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].amount, 10700);
    assert_eq!(payouts[0].idempotency_key, "payout-pi_early");

    let metadata = h.gateway.metadata("pi_early");
    assert_eq!(metadata["ali_order_id"], "819000001");
    assert_eq!(metadata["payout_id"], "po_1");
    assert_eq!(metadata["payout_status"], "pending");
    assert_eq!(metadata["expected_payout_cents"], "10700");
    assert!(h.notifier.sent().is_empty());

    // The payout landing settles the early order with one email.
    let settled = h
        .service
        .handle_event(payout_paid("pi_early", 10700))
        .await
        .unwrap();
    assert_eq!(
        settled,
        FulfillmentOutcome::Fulfilled {
            order_id: "819000001".into(),
            notified: true
        }
    );
    let metadata = h.gateway.metadata("pi_early");
    assert_eq!(metadata["payout_status"], "paid");
    assert_eq!(metadata["profit_usd"], "65.00");

    let duplicate = h
        .service
        .handle_event(payout_paid("pi_early", 10700))
        .await
        .unwrap();
    assert_matches!(duplicate, FulfillmentOutcome::AlreadyFulfilled { .. });

    assert_eq!(h.supplier.calls(), 1);
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn early_path_defers_payout_on_low_balance() {
    let intent = checkout_intent("pi_lowbal");
    let h = Harness::new(FakeGateway::with_intent(intent.clone()));
    h.gateway.set_available(100);

    let outcome = h
        .service
        .handle_event(payment_succeeded(&intent))
        .await
        .unwrap();

    assert_matches!(
        outcome,
        FulfillmentOutcome::EarlyPath {
            order_id: Some(_),
            payout: PayoutStep::DeferredInsufficientBalance
        }
    );
    assert!(h.gateway.payouts().is_empty());
    assert_eq!(
        h.gateway.metadata("pi_lowbal")["payout_status"],
        "deferred_insufficient_balance"
    );
}

#[tokio::test]
async fn deferred_payout_is_created_once_balance_arrives() {
    let intent = checkout_intent("pi_retry");
    let h = Harness::new(FakeGateway::with_intent(intent.clone()));
    h.gateway.set_available(100);
    h.service
        .handle_event(payment_succeeded(&intent))
        .await
        .unwrap();
    assert!(h.gateway.payouts().is_empty());

    // Still short: the sweep leaves it deferred.
    let steps = h.service.retry_deferred_payouts().await.unwrap();
    assert_eq!(
        steps,
        vec![("pi_retry".to_string(), PayoutStep::DeferredInsufficientBalance)]
    );

    h.gateway.set_available(50_000);
    let steps = h.service.retry_deferred_payouts().await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_matches!(&steps[0].1, PayoutStep::Created { .. });

    let payouts = h.gateway.payouts();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].amount, 10700);
    let metadata = h.gateway.metadata("pi_retry");
    assert_eq!(metadata["payout_status"], "pending");
    assert_eq!(metadata["expected_payout_cents"], "10700");

    // Nothing left to sweep.
    assert!(h.service.retry_deferred_payouts().await.unwrap().is_empty());
    assert_eq!(h.supplier.calls(), 1);
}

#[tokio::test]
async fn early_path_skips_fulfilled_intents() {
    let mut intent = awaiting_payout_intent("pi_done");
    intent.metadata.insert("ali_order_id".into(), "8190777".into());
    let h = Harness::new(FakeGateway::with_intent(intent.clone()));

    let outcome = h
        .service
        .handle_event(payment_succeeded(&intent))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FulfillmentOutcome::EarlyPath {
            order_id: None,
            payout: PayoutStep::AlreadyRecorded
        }
    );
    assert_eq!(h.supplier.calls(), 0);
}

#[tokio::test]
async fn early_path_supplier_failure_still_creates_payout() {
    let intent = checkout_intent("pi_early_fail");
    let h = Harness::new(FakeGateway::with_intent(intent.clone()));
    h.gateway.set_available(50_000);
    h.supplier.fail.store(true, Ordering::SeqCst);

    let outcome = h
        .service
        .handle_event(payment_succeeded(&intent))
        .await
        .unwrap();

    assert_matches!(
        outcome,
        FulfillmentOutcome::EarlyPath {
            order_id: None,
            payout: PayoutStep::Created { .. }
        }
    );
    assert!(!h.gateway.metadata("pi_early_fail").contains_key("ali_order_id"));
}

#[tokio::test]
async fn failed_payment_sends_failure_email() {
    let mut value = serde_json::to_value(checkout_intent("pi_declined")).unwrap();
    value["status"] = json!("requires_payment_method");
    value["receipt_email"] = json!(null);
    value["latest_charge"]["billing_details"]["email"] = json!("a@x.com");
    value["last_payment_error"] = json!({"code": "card_declined", "message": "Your card was declined."});
    let intent = intent_from(value);
    let h = Harness::new(FakeGateway::with_intent(intent.clone()));

    let outcome = h
        .service
        .handle_event(GatewayEvent::PaymentIntentFailed {
            event_id: "evt_fail".into(),
            intent,
        })
        .await
        .unwrap();

    assert_eq!(outcome, FulfillmentOutcome::FailureNotified { notified: true });
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Failure);
    assert_eq!(sent[0].to, "a@x.com");
    assert_eq!(
        sent[0].context.failure_reason.as_deref(),
        Some("Your card was declined.")
    );
    assert_eq!(h.supplier.calls(), 0);
    assert_eq!(h.gateway.updates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unhandled_event_types_are_ignored() {
    let h = Harness::new(FakeGateway::default());

    let outcome = h
        .service
        .handle_event(GatewayEvent::Other {
            event_id: "evt_other".into(),
            event_type: "charge.refunded".into(),
        })
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FulfillmentOutcome::Ignored {
            event_type: "charge.refunded".into()
        }
    );
    assert_eq!(h.gateway.total_calls(), 0);
}

fn shipped_intent(id: &str, order_id: &str) -> dropship_api::models::PaymentIntent {
    let mut intent = awaiting_payout_intent(id);
    intent.metadata.insert("ali_order_id".into(), order_id.into());
    intent.metadata.insert("ali_tracking".into(), "PENDING".into());
    intent.metadata.insert("payout_status".into(), "paid".into());
    intent
}

fn shipment(order_id: &str, tracking: Option<&str>) -> SupplierShipment {
    SupplierShipment {
        order_id: order_id.into(),
        tracking_number: tracking.map(str::to_string),
        status: Some("WAIT_BUYER_ACCEPT_GOODS".into()),
    }
}

#[tokio::test]
async fn supplier_shipment_records_tracking_once() {
    let h = Harness::new(FakeGateway::with_intent(shipped_intent("pi_ship", "8190123")));

    let outcome = h
        .service
        .handle_supplier_shipment(shipment("8190123", Some("LX123456789CN")))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        FulfillmentOutcome::TrackingUpdated {
            intent_id: "pi_ship".into(),
            notified: true
        }
    );
    assert_eq!(h.gateway.metadata("pi_ship")["ali_tracking"], "LX123456789CN");
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::TrackingUpdate);
    assert_eq!(
        sent[0].context.tracking_number.as_deref(),
        Some("LX123456789CN")
    );

    let again = h
        .service
        .handle_supplier_shipment(shipment("8190123", Some("LX123456789CN")))
        .await
        .unwrap();
    assert_eq!(again, FulfillmentOutcome::TrackingUnchanged);
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn shipment_for_unknown_order_is_uncorrelated() {
    let h = Harness::new(FakeGateway::with_intent(shipped_intent("pi_ship", "8190123")));

    let outcome = h
        .service
        .handle_supplier_shipment(shipment("9999", Some("LX1")))
        .await
        .unwrap();

    assert_eq!(outcome, FulfillmentOutcome::Uncorrelated);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn shipment_without_waybill_is_skipped() {
    let h = Harness::new(FakeGateway::with_intent(shipped_intent("pi_ship", "8190123")));

    let outcome = h
        .service
        .handle_supplier_shipment(shipment("8190123", Some("PENDING")))
        .await
        .unwrap();

    assert_eq!(outcome, FulfillmentOutcome::TrackingUnchanged);
    assert_eq!(h.gateway.searches.load(Ordering::SeqCst), 0);
}
