//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with store status
//! - `GET /ready` - Kubernetes-compatible readiness probe
//!
//! Both bypass the trust gate, so probes never consume quota.
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Returns 200 even if degraded, includes details
//! - **Readiness** (`/ready`): Returns 503 if the store does not answer

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// Always returns 200 OK with status details in the body.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "store_backend": "redis",
///   "store_reachable": true,
///   "store_circuit": "closed",
///   "store_failure_policy": "open",
///   "uptime_seconds": 3600,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_reachable = match state.ping_store().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Health check: store ping failed");
            false
        }
    };

    Json(HealthResponse {
        status: if store_reachable {
            "healthy"
        } else {
            "degraded"
        }
        .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_backend: state.store.backend().to_string(),
        store_reachable,
        store_circuit: state.store_circuit().await.to_string(),
        store_failure_policy: state.config.store_failure_policy.to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// # Usage
///
/// ```yaml
/// readinessProbe:
///   httpGet:
///     path: /ready
///     port: 3000
///   periodSeconds: 10
/// ```
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    match state.ping_store().await {
        Ok(()) => Ok(StatusCode::OK),
        Err(e) => {
            warn!(error = %e, "Readiness check: store ping failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
