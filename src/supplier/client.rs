//! AliExpress dropshipping order client.

use super::credentials::CredentialStore;
use super::signing;
use super::{OrderLine, PlacedOrder, SupplierOrders};
use crate::errors::ServiceError;
use crate::models::payment_intent::{from_cents, TRACKING_PENDING};
use crate::models::ShippingAddress;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const PLACE_ORDER_METHOD: &str = "aliexpress.trade.buy.placeorder";
pub const ORDER_GET_METHOD: &str = "aliexpress.trade.ds.order.get";

/// Builds the seller authorization URL the operator is redirected to.
pub fn authorize_url(authorize_base: &str, app_key: &str, redirect_uri: &str) -> Result<Url, ServiceError> {
    let mut url = Url::parse(authorize_base)
        .map_err(|e| ServiceError::InternalError(format!("invalid authorize url: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("force_auth", "true")
        .append_pair("client_id", app_key)
        .append_pair("redirect_uri", redirect_uri);
    Ok(url)
}

pub struct AliExpressClient {
    http: reqwest::Client,
    credentials: Arc<CredentialStore>,
    logistics_service: Option<String>,
}

impl AliExpressClient {
    pub fn new(http: reqwest::Client, credentials: Arc<CredentialStore>) -> Self {
        Self {
            http,
            credentials,
            logistics_service: None,
        }
    }

    /// Shipping service requested for every product line, e.g. `CAINIAO_STANDARD`.
    pub fn with_logistics_service(mut self, service: Option<String>) -> Self {
        self.logistics_service = service.filter(|s| !s.is_empty());
        self
    }

    /// Issues a signed `/sync` call and returns the `<method>_response` node.
    async fn call(
        &self,
        method: &str,
        business: BTreeMap<String, String>,
    ) -> Result<Value, ServiceError> {
        let token = self
            .credentials
            .get_valid_token()
            .await
            .map_err(ServiceError::into_supplier_error)?;
        let app = self.credentials.app();

        let mut params = app.base_params();
        params.insert("method".to_string(), method.to_string());
        params.insert("session".to_string(), token.access_token.clone());
        params.insert("access_token".to_string(), token.access_token);
        params.extend(business);
        let params = signing::signed(&app.app_secret, None, params);

        let response = self
            .http
            .post(app.sync_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| ServiceError::supplier("transport", e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::supplier("transport", e.to_string()))?;
        if !status.is_success() {
            return Err(ServiceError::supplier(
                format!("http_{}", status.as_u16()),
                body.chars().take(200).collect::<String>(),
            ));
        }

        let envelope: Value = serde_json::from_str(&body)
            .map_err(|_| ServiceError::supplier("invalid_response", "response is not JSON"))?;
        parse_envelope(method, envelope)
    }

    async fn fetch_order_details(&self, order_id: &str) -> Result<(Option<String>, Decimal), ServiceError> {
        let mut business = BTreeMap::new();
        business.insert(
            "single_order_query".to_string(),
            json!({ "order_id": order_id }).to_string(),
        );

        let node = self.call(ORDER_GET_METHOD, business).await?;
        let result = node
            .get("result")
            .ok_or_else(|| ServiceError::supplier("missing_result", "order detail has no result"))?;

        let tracking = result
            .pointer("/logistics_info_list/aeop_order_logistics_info")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(|info| info.get("logistics_no"))
            .and_then(scalar_string)
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case(TRACKING_PENDING));

        let cost = result
            .pointer("/order_amount/amount")
            .and_then(scalar_string)
            .and_then(|raw| i64::from_str(raw.trim()).ok())
            .map(from_cents)
            .unwrap_or(Decimal::ZERO);

        Ok((tracking, cost))
    }
}

#[async_trait]
impl SupplierOrders for AliExpressClient {
    #[instrument(skip(self, items, shipping), fields(lines = items.len()))]
    async fn place_order(
        &self,
        items: &[OrderLine],
        shipping: Option<&ShippingAddress>,
    ) -> Result<PlacedOrder, ServiceError> {
        if items.is_empty() {
            return Err(ServiceError::InvalidInput(
                "cannot place a supplier order without items".to_string(),
            ));
        }

        let mut request = json!({
            "product_items": items
                .iter()
                .map(|line| product_item(line, self.logistics_service.as_deref()))
                .collect::<Vec<_>>(),
        });
        if let Some(address) = shipping {
            request["logistics_address"] = logistics_address(address);
        }

        let mut business = BTreeMap::new();
        business.insert(
            "param_place_order_request4_open_api_d_t_o".to_string(),
            request.to_string(),
        );

        let node = self.call(PLACE_ORDER_METHOD, business).await?;
        let result = node
            .get("result")
            .ok_or_else(|| ServiceError::supplier("missing_result", "placeorder has no result"))?;

        if result.get("is_success").and_then(Value::as_bool) == Some(false) {
            let code = result
                .get("error_code")
                .and_then(scalar_string)
                .unwrap_or_else(|| "placeorder_failed".to_string());
            let message = result
                .get("error_msg")
                .and_then(scalar_string)
                .unwrap_or_else(|| "order was not accepted".to_string());
            return Err(ServiceError::supplier(code, message));
        }

        let order_id = result
            .pointer("/order_list/number")
            .and_then(Value::as_array)
            .or_else(|| result.get("order_list").and_then(Value::as_array))
            .and_then(|ids| ids.first())
            .and_then(scalar_string)
            .ok_or_else(|| ServiceError::supplier("missing_order_id", "placeorder returned no order id"))?;

        info!(%order_id, "supplier order placed");

        // The order exists now; detail lookups only enrich it.
        let (tracking_number, order_cost) = match self.fetch_order_details(&order_id).await {
            Ok(details) => details,
            Err(e) => {
                warn!(%order_id, error = %e, "supplier order detail lookup failed");
                (None, Decimal::ZERO)
            }
        };
        debug!(%order_id, tracking = ?tracking_number, %order_cost, "supplier order details");

        Ok(PlacedOrder {
            order_id,
            tracking_number,
            order_cost,
        })
    }
}

fn product_item(line: &OrderLine, logistics_service: Option<&str>) -> Value {
    let mut item = json!({
        "product_id": line.product_id,
        "product_count": line.quantity,
    });
    if let Some(sku) = &line.sku_attr {
        item["sku_attr"] = json!(sku);
    }
    if let Some(service) = logistics_service {
        item["logistics_service_name"] = json!(service);
    }
    item
}

fn logistics_address(address: &ShippingAddress) -> Value {
    let mut value = json!({
        "full_name": address.name,
        "contact_person": address.name,
        "address": address.line1,
        "city": address.city,
        "province": address.state,
        "zip": address.postal_code,
        "country": address.country,
    });
    if let Some(line2) = address.line2.as_deref().filter(|l| !l.is_empty()) {
        value["address2"] = json!(line2);
    }
    if let Some(phone) = address.phone.as_deref().filter(|p| !p.is_empty()) {
        value["mobile_no"] = json!(phone);
    }
    value
}

/// Unwraps `{"<method>_response": {...}}`, mapping `error_response` to a supplier error.
fn parse_envelope(method: &str, mut envelope: Value) -> Result<Value, ServiceError> {
    if let Some(error) = envelope.get("error_response") {
        let code = error
            .get("code")
            .and_then(scalar_string)
            .unwrap_or_else(|| "unknown".to_string());
        let message = error
            .get("msg")
            .or_else(|| error.get("sub_msg"))
            .and_then(scalar_string)
            .unwrap_or_else(|| "no message".to_string());
        return Err(ServiceError::supplier(code, message));
    }

    let node_name = format!("{}_response", method.replace('.', "_"));
    envelope
        .get_mut(&node_name)
        .map(Value::take)
        .ok_or_else(|| {
            ServiceError::supplier("missing_result", format!("response has no {}", node_name))
        })
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
