//! Supplier integration: signed open-platform calls, the bearer-token
//! lifecycle, and order placement.

pub mod client;
pub mod credentials;
pub mod refresher;
pub mod signing;

use crate::errors::ServiceError;
use crate::models::{LineItem, ShippingAddress};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use client::AliExpressClient;
pub use credentials::{
    CredentialStore, InMemoryTokenRepository, SeaOrmTokenRepository, SupplierApp, TokenRepository,
};
pub use refresher::TokenRefresher;

/// One product line sent to the supplier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: String,
    pub quantity: u32,
    pub sku_attr: Option<String>,
}

impl From<&LineItem> for OrderLine {
    fn from(item: &LineItem) -> Self {
        Self {
            product_id: item.ali_id.clone(),
            quantity: item.quantity,
            sku_attr: item.sku_attr.clone().filter(|s| !s.is_empty()),
        }
    }
}

/// Result of a successful placement.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order_id: String,
    /// `None` until the supplier issues a waybill.
    pub tracking_number: Option<String>,
    /// Dollars
    pub order_cost: Decimal,
}

#[async_trait]
pub trait SupplierOrders: Send + Sync {
    async fn place_order(
        &self,
        items: &[OrderLine],
        shipping: Option<&ShippingAddress>,
    ) -> Result<PlacedOrder, ServiceError>;
}
