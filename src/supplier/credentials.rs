//! Supplier bearer-token lifecycle.
//!
//! A single token row is shared by every request. Callers go through
//! [`CredentialStore::get_valid_token`], which refreshes lazily once less than
//! five minutes of validity remain. Refreshes are serialized so two requests
//! never spend the same refresh token.

use super::signing::{self, SIGN_METHOD};
use crate::errors::ServiceError;
use crate::models::supplier_token::{self, SupplierToken, SINGLETON_ID};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait, Set};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Remaining validity below which a token is refreshed before use.
pub const REFRESH_MARGIN_MINUTES: i64 = 5;

pub const TOKEN_CREATE_PATH: &str = "/auth/token/create";
pub const TOKEN_REFRESH_PATH: &str = "/auth/token/refresh";

/// Durable home of the singleton token record.
#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn load(&self) -> Result<Option<SupplierToken>, ServiceError>;
    async fn save(&self, token: &SupplierToken) -> Result<(), ServiceError>;
}

/// sea-orm backed repository over `supplier_tokens`.
pub struct SeaOrmTokenRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmTokenRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TokenRepository for SeaOrmTokenRepository {
    async fn load(&self) -> Result<Option<SupplierToken>, ServiceError> {
        let row = supplier_token::Entity::find_by_id(SINGLETON_ID)
            .one(&*self.db)
            .await?;
        Ok(row.map(SupplierToken::from))
    }

    async fn save(&self, token: &SupplierToken) -> Result<(), ServiceError> {
        let model = supplier_token::ActiveModel {
            id: Set(SINGLETON_ID),
            access_token: Set(token.access_token.clone()),
            refresh_token: Set(token.refresh_token.clone()),
            expires_at: Set(token.expires_at),
            updated_at: Set(Utc::now()),
        };

        supplier_token::Entity::insert(model)
            .on_conflict(
                OnConflict::column(supplier_token::Column::Id)
                    .update_columns([
                        supplier_token::Column::AccessToken,
                        supplier_token::Column::RefreshToken,
                        supplier_token::Column::ExpiresAt,
                        supplier_token::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}

/// Process-local repository for tests and database-less runs.
#[derive(Default)]
pub struct InMemoryTokenRepository {
    token: RwLock<Option<SupplierToken>>,
}

impl InMemoryTokenRepository {
    pub fn with_token(token: SupplierToken) -> Self {
        Self {
            token: RwLock::new(Some(token)),
        }
    }
}

#[async_trait]
impl TokenRepository for InMemoryTokenRepository {
    async fn load(&self) -> Result<Option<SupplierToken>, ServiceError> {
        Ok(self.token.read().await.clone())
    }

    async fn save(&self, token: &SupplierToken) -> Result<(), ServiceError> {
        *self.token.write().await = Some(token.clone());
        Ok(())
    }
}

/// App registration on the supplier open platform.
#[derive(Clone)]
pub struct SupplierApp {
    pub app_key: String,
    pub app_secret: String,
    /// e.g. `https://api-sg.aliexpress.com`
    pub api_base: String,
}

impl SupplierApp {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn rest_url(&self, path: &str) -> String {
        format!("{}/rest{}", self.api_base, path)
    }

    pub(crate) fn sync_url(&self) -> String {
        format!("{}/sync", self.api_base)
    }

    /// Common parameters every signed call carries.
    pub(crate) fn base_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("app_key".to_string(), self.app_key.clone());
        params.insert("sign_method".to_string(), SIGN_METHOD.to_string());
        params.insert(
            "timestamp".to_string(),
            Utc::now().timestamp_millis().to_string(),
        );
        params
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default, deserialize_with = "lenient_string")]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    expires_in: Option<i64>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Guarantees callers a non-expired supplier bearer token.
pub struct CredentialStore {
    repo: Arc<dyn TokenRepository>,
    http: reqwest::Client,
    app: SupplierApp,
    refresh_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(repo: Arc<dyn TokenRepository>, http: reqwest::Client, app: SupplierApp) -> Self {
        Self {
            repo,
            http,
            app,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn app(&self) -> &SupplierApp {
        &self.app
    }

    fn margin() -> Duration {
        Duration::minutes(REFRESH_MARGIN_MINUTES)
    }

    /// Returns the current token, refreshing it first when it is about to expire.
    #[instrument(skip(self))]
    pub async fn get_valid_token(&self) -> Result<SupplierToken, ServiceError> {
        let token = self.repo.load().await?.ok_or(ServiceError::NotConnected)?;
        if !token.expires_within(Self::margin(), Utc::now()) {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another request may have refreshed while we waited.
        let token = self.repo.load().await?.ok_or(ServiceError::NotConnected)?;
        if !token.expires_within(Self::margin(), Utc::now()) {
            debug!("supplier token refreshed by a concurrent request");
            return Ok(token);
        }

        self.refresh(token).await
    }

    /// Stored record without refreshing it.
    pub async fn current(&self) -> Result<Option<SupplierToken>, ServiceError> {
        self.repo.load().await
    }

    /// Upserts the singleton record.
    #[instrument(skip(self, access_token, refresh_token))]
    pub async fn store_token(
        &self,
        access_token: String,
        refresh_token: String,
        expires_in_secs: i64,
    ) -> Result<SupplierToken, ServiceError> {
        let token = SupplierToken::issued_at(Utc::now(), access_token, refresh_token, expires_in_secs);
        self.repo.save(&token).await?;
        info!(expires_at = %token.expires_at, "supplier token stored");
        Ok(token)
    }

    /// Exchanges an OAuth authorization code for a token and stores it.
    #[instrument(skip(self, code))]
    pub async fn exchange_code(&self, code: &str) -> Result<SupplierToken, ServiceError> {
        let mut params = self.app.base_params();
        params.insert("code".to_string(), code.to_string());

        let response = self
            .call_token_endpoint(TOKEN_CREATE_PATH, params)
            .await
            .map_err(|reason| ServiceError::supplier("token_create", reason))?;

        let access_token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServiceError::supplier("token_create", "no access_token in response"))?;
        let refresh_token = response.refresh_token.unwrap_or_default();
        let expires_in = response
            .expires_in
            .ok_or_else(|| ServiceError::supplier("token_create", "no expires_in in response"))?;

        self.store_token(access_token, refresh_token, expires_in).await
    }

    async fn refresh(&self, current: SupplierToken) -> Result<SupplierToken, ServiceError> {
        info!(expires_at = %current.expires_at, "refreshing supplier token");

        let mut params = self.app.base_params();
        params.insert("refresh_token".to_string(), current.refresh_token.clone());

        let response = self
            .call_token_endpoint(TOKEN_REFRESH_PATH, params)
            .await
            .map_err(|reason| {
                warn!(%reason, "supplier token refresh failed");
                ServiceError::RefreshFailed(reason)
            })?;

        let access_token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServiceError::RefreshFailed("no access_token in response".into()))?;
        let expires_in = response
            .expires_in
            .ok_or_else(|| ServiceError::RefreshFailed("no expires_in in response".into()))?;
        let refresh_token = response
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or(current.refresh_token);

        let token = SupplierToken::issued_at(Utc::now(), access_token, refresh_token, expires_in);
        self.repo.save(&token).await?;
        info!(expires_at = %token.expires_at, "supplier token refreshed");
        Ok(token)
    }

    /// Calls a signed `/rest` token endpoint; `Err` carries a human-readable reason.
    async fn call_token_endpoint(
        &self,
        path: &str,
        params: BTreeMap<String, String>,
    ) -> Result<TokenResponse, String> {
        let params = signing::signed(&self.app.app_secret, Some(path), params);

        let response = self
            .http
            .post(self.app.rest_url(path))
            .form(&params)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("unreadable response: {}", e))?;

        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status.as_u16(), truncate(&body)));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|_| format!("non-JSON response: {}", truncate(&body)))?;

        match parsed.code.as_deref() {
            None | Some("0") => Ok(parsed),
            Some(code) => Err(format!(
                "{}: {}",
                code,
                parsed.message.as_deref().unwrap_or("no message")
            )),
        }
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}
