//! Endpoints behind [`crate::middleware::BearerAuthLayer`].
//!
//! The layer inserts the verified [`SessionClaims`] into request extensions,
//! so these handlers never see an unverified token.

use axum::Json;
use axum::extract::{Extension, State};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::error::AppResult;
use crate::models::{LogoutAllResponse, SessionResponse};
use crate::services::SessionClaims;
use crate::state::AppState;

fn from_epoch_secs(secs: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)
}

/// Identity carried by the presented token.
#[instrument(skip(claims), fields(user_id = %claims.user_id))]
pub async fn current_session(
    Extension(claims): Extension<SessionClaims>,
) -> Json<SessionResponse> {
    Json(SessionResponse {
        issued_at: from_epoch_secs(claims.iat),
        expires_at: from_epoch_secs(claims.exp),
        user_id: claims.user_id,
        email: claims.email,
        token_version: claims.token_version,
        password_changed_at: claims.password_changed_at,
    })
}

/// Revoke every token issued to the caller, including the one presented.
#[instrument(skip(state, claims), fields(user_id = %claims.user_id))]
pub async fn logout_all(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
) -> AppResult<Json<LogoutAllResponse>> {
    let token_version = state
        .tokens
        .directory()
        .revoke_all_sessions(&claims.user_id)
        .await?;
    info!(token_version, "User logged out of all sessions");

    Ok(Json(LogoutAllResponse {
        user_id: claims.user_id,
        token_version,
        message: "All sessions have been revoked".to_string(),
    }))
}
