use crate::models::{Expandable, PaymentIntent};

fn usable(email: Option<&String>) -> Option<String> {
    email
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .map(str::to_string)
}

/// Picks the customer address in priority order: receipt email, live customer
/// record, payment method billing, then latest charge billing.
pub fn resolve_recipient(intent: &PaymentIntent) -> Option<String> {
    usable(intent.receipt_email.as_ref())
        .or_else(|| {
            intent
                .customer
                .as_ref()
                .and_then(Expandable::as_object)
                .filter(|c| !c.deleted)
                .and_then(|c| usable(c.email.as_ref()))
        })
        .or_else(|| {
            intent
                .payment_method
                .as_ref()
                .and_then(Expandable::as_object)
                .and_then(|pm| usable(pm.billing_details.email.as_ref()))
        })
        .or_else(|| intent.charge().and_then(|c| usable(c.billing_details.email.as_ref())))
}
