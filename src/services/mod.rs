pub mod fulfillment;
pub mod lease;
pub mod payout_retry;
pub mod recipient;

pub use fulfillment::{FulfillmentOutcome, FulfillmentService, PayoutStep};
pub use lease::{IntentLease, LeaseToken, LocalLease, RedisLease};
pub use payout_retry::PayoutRetrier;
pub use recipient::resolve_recipient;
