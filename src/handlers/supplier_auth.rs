use crate::errors::ServiceError;
use crate::supplier::client::authorize_url;
use crate::AppState;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// `GET /supplier/oauth/authorize`: sends the operator to the supplier consent page.
pub async fn authorize(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let redirect_uri = state
        .config
        .ali_redirect_uri
        .as_deref()
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| ServiceError::BadRequest("ali_redirect_uri is not configured".into()))?;

    let url = authorize_url(
        &state.config.ali_authorize_url,
        &state.config.ali_app_key,
        redirect_uri,
    )?;
    Ok((StatusCode::FOUND, [(header::LOCATION, url.to_string())]))
}

/// `GET /supplier/oauth/callback?code=...`: exchanges the code and stores the token.
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>, ServiceError> {
    if let Some(error) = query.error {
        warn!(%error, "supplier authorization was declined");
        return Err(ServiceError::BadRequest(format!(
            "authorization failed: {}",
            query.error_description.unwrap_or(error)
        )));
    }

    let code = query
        .code
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ServiceError::BadRequest("missing authorization code".into()))?;

    let token = state.credentials.exchange_code(code.trim()).await?;
    info!(expires_at = %token.expires_at, "supplier account connected");

    Ok(Json(json!({
        "connected": true,
        "expires_at": token.expires_at.to_rfc3339(),
    })))
}
