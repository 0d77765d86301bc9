//! Request signing for the supplier open platform.
//!
//! Parameters are sorted by key, concatenated as `key1value1key2value2...`,
//! optionally prefixed with the API path (for `/rest` endpoints), and signed
//! with HMAC-SHA256 keyed by the app secret. The digest travels as uppercase
//! hex in the `sign` parameter.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

pub const SIGN_METHOD: &str = "sha256";

/// Computes the `sign` value for a parameter set.
pub fn sign_params(secret: &str, api_path: Option<&str>, params: &BTreeMap<String, String>) -> String {
    let mut payload = String::new();
    if let Some(path) = api_path {
        payload.push_str(path);
    }
    // BTreeMap iterates in key order.
    for (key, value) in params {
        if key == "sign" {
            continue;
        }
        payload.push_str(key);
        payload.push_str(value);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode_upper(mac.finalize().into_bytes())
}

/// Returns the parameters with `sign` attached.
pub fn signed(
    secret: &str,
    api_path: Option<&str>,
    mut params: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let sign = sign_params(secret, api_path, &params);
    params.insert("sign".to_string(), sign);
    params
}
