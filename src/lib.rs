//! Dropship fulfillment API
//!
//! Turns payment gateway webhooks into supplier orders and customer email.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod migrator;
pub mod models;
pub mod notifications;
pub mod payments;
pub mod services;
pub mod supplier;
pub mod tracing;

use axum::{
    routing::{get, post},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::payments::WebhookVerifier;
use crate::services::FulfillmentService;
use crate::supplier::CredentialStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub fulfillment: Arc<FulfillmentService>,
    pub credentials: Arc<CredentialStore>,
    pub verifier: WebhookVerifier,
    pub db: Option<Arc<DatabaseConnection>>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        fulfillment: Arc<FulfillmentService>,
        credentials: Arc<CredentialStore>,
        db: Option<Arc<DatabaseConnection>>,
    ) -> Self {
        let verifier = WebhookVerifier::new(
            config.stripe_webhook_secret.clone(),
            config.stripe_webhook_tolerance_secs,
        );
        Self {
            config,
            fulfillment,
            credentials,
            verifier,
            db,
        }
    }
}

/// Outbound client shared by the gateway, supplier and mail integrations.
pub fn build_http_client(timeout: std::time::Duration) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .user_agent(concat!("dropship-api/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {}", e)))
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/status", get(handlers::health::status))
        .route("/webhook", post(handlers::webhooks::gateway_webhook))
        .route("/webhook/supplier", post(handlers::webhooks::supplier_webhook))
        .route(
            "/supplier/oauth/authorize",
            get(handlers::supplier_auth::authorize),
        )
        .route(
            "/supplier/oauth/callback",
            get(handlers::supplier_auth::callback),
        )
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            crate::tracing::request_id_middleware,
        ))
        .with_state(state)
}
