pub mod health;
pub mod supplier_auth;
pub mod webhooks;
