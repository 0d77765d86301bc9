use serde::{Deserialize, Deserializer, Serialize};

/// Shipment push from the supplier for an order we placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierShipment {
    #[serde(deserialize_with = "id_string")]
    pub order_id: String,
    #[serde(default, alias = "logistics_no", alias = "trackingNumber")]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "order_id must be a non-empty string or number, got {}",
            other
        ))),
    }
}
