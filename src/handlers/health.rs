use crate::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: ComponentStatus,
    pub version: &'static str,
    pub timestamp: String,
    pub database: ComponentHealth,
    pub supplier: ComponentHealth,
}

/// Liveness check
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "up",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339()
    }))
}

/// Dependency status: database reachability and supplier connection.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let database = match &state.db {
        Some(db) => {
            let start = Instant::now();
            match crate::db::check_connection(db).await {
                Ok(()) => ComponentHealth {
                    status: ComponentStatus::Up,
                    message: "reachable".to_string(),
                    latency_ms: Some(start.elapsed().as_millis() as u64),
                },
                Err(e) => ComponentHealth {
                    status: ComponentStatus::Down,
                    message: e.response_message(),
                    latency_ms: None,
                },
            }
        }
        None => ComponentHealth {
            status: ComponentStatus::Degraded,
            message: "no database; supplier token held in memory".to_string(),
            latency_ms: None,
        },
    };

    let supplier = match state.credentials.current().await {
        Ok(Some(token)) if token.expires_at <= Utc::now() => ComponentHealth {
            status: ComponentStatus::Degraded,
            message: "token expired; next request refreshes it".to_string(),
            latency_ms: None,
        },
        Ok(Some(token)) if token.expires_within(Duration::minutes(5), Utc::now()) => ComponentHealth {
            status: ComponentStatus::Up,
            message: "connected; token due for refresh".to_string(),
            latency_ms: None,
        },
        Ok(Some(token)) => ComponentHealth {
            status: ComponentStatus::Up,
            message: format!("connected until {}", token.expires_at.to_rfc3339()),
            latency_ms: None,
        },
        Ok(None) => ComponentHealth {
            status: ComponentStatus::Down,
            message: "not connected; visit /supplier/oauth/authorize".to_string(),
            latency_ms: None,
        },
        Err(e) => ComponentHealth {
            status: ComponentStatus::Down,
            message: e.response_message(),
            latency_ms: None,
        },
    };

    let overall = if database.status == ComponentStatus::Down || supplier.status == ComponentStatus::Down {
        ComponentStatus::Degraded
    } else {
        ComponentStatus::Up
    };

    Json(StatusResponse {
        status: overall,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
        database,
        supplier,
    })
}
