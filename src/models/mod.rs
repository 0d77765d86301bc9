// Gateway-owned records, as seen through the payment gateway API
pub mod payment_intent;
pub mod payout;
pub mod shipment;

// Persisted entities
pub mod supplier_token;

pub use payment_intent::{
    BillingDetails, CardDetails, Charge, Customer, Expandable, FulfillmentState, LineItem,
    Metadata, OrderTotals, PaymentIntent, PaymentMethod, ShippingAddress,
};
pub use payout::{Balance, BalanceAmount, Payout, PayoutRequest};
pub use shipment::SupplierShipment;
pub use supplier_token::SupplierToken;
