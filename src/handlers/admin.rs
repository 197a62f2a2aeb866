//! Operator endpoints for the trusted-IP registry, identifier state and
//! session issuance.
//!
//! Mounted under `/admin` only when `ADMIN_API_KEY` is configured. The
//! service does not check passwords itself: the login service that does
//! calls `POST /admin/sessions` to mint tokens and
//! `POST /admin/users/{id}/password-changed` after a reset.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{info, instrument};

use crate::error::{AppError, AppResult, TokenError};
use crate::models::{
    AddTrustedIpRequest, IdentifierResponse, IssueSessionRequest, IssuedSessionResponse,
    LiftBanResponse, TrustCheckResponse, TrustedIpListResponse,
};
use crate::services::TrustedIpConfig;
use crate::services::trusted_ips::canonical_ip;
use crate::state::AppState;
use crate::validation::{
    validate_add_trusted_ip, validate_ip_address, validate_issue_session, validate_user_id,
};

/// List live dynamic entries and the configured static ranges.
#[instrument(skip(state))]
pub async fn list_trusted_ips(
    State(state): State<AppState>,
) -> AppResult<Json<TrustedIpListResponse>> {
    let entries = state.registry.list_trusted_ips().await?;
    let static_ranges = state
        .registry
        .ranges()
        .iter()
        .map(|r| r.cidr.clone())
        .collect();

    Ok(Json(TrustedIpListResponse {
        count: entries.len(),
        entries,
        static_ranges,
    }))
}

/// Register (or replace) a dynamic trusted IP.
#[instrument(skip(state, payload), fields(ip = %payload.ip_address))]
pub async fn add_trusted_ip(
    State(state): State<AppState>,
    Json(payload): Json<AddTrustedIpRequest>,
) -> AppResult<(StatusCode, Json<TrustedIpConfig>)> {
    let config = validate_add_trusted_ip(payload, Utc::now())?;
    let stored = state.registry.add_trusted_ip(config).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// Explain whether an address is trusted and why.
#[instrument(skip(state))]
pub async fn check_trusted_ip(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> AppResult<Json<TrustCheckResponse>> {
    let check = state.registry.is_trusted(&ip).await?;
    Ok(Json(TrustCheckResponse {
        ip: canonical_ip(&ip),
        check,
    }))
}

#[instrument(skip(state))]
pub async fn remove_trusted_ip(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> AppResult<StatusCode> {
    let ip = validate_ip_address(&ip)?;
    if state.registry.remove_trusted_ip(&ip).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Trusted IP '{ip}' not found")))
    }
}

/// Behavior snapshot and ban state of an identifier.
#[instrument(skip(state))]
pub async fn get_identifier(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> AppResult<Json<IdentifierResponse>> {
    let metrics = state.limiter.tracker().load(&identifier).await?;
    let ban_remaining = state.limiter.ban_remaining(&identifier).await?;

    Ok(Json(IdentifierResponse {
        success_rate: metrics.success_rate(),
        identifier,
        metrics,
        banned: ban_remaining.is_some(),
        ban_expires_in_secs: ban_remaining.map(|d| d.as_secs()),
    }))
}

/// Lift a ban and reset the violation count.
#[instrument(skip(state))]
pub async fn lift_ban(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> AppResult<Json<LiftBanResponse>> {
    let ban_lifted = state.limiter.lift_ban(&identifier).await?;
    if ban_lifted {
        info!(identifier = %identifier, "Ban lifted by operator");
    }
    Ok(Json(LiftBanResponse {
        identifier,
        ban_lifted,
    }))
}

fn token_error(e: TokenError) -> AppError {
    match e {
        TokenError::Directory(e) => AppError::StoreUnavailable(e),
        other => AppError::Internal(other.to_string()),
    }
}

/// Mint a session token, registering the user on first issue.
#[instrument(skip(state, payload), fields(user_id = %payload.user_id))]
pub async fn issue_session(
    State(state): State<AppState>,
    Json(payload): Json<IssueSessionRequest>,
) -> AppResult<(StatusCode, Json<IssuedSessionResponse>)> {
    let now = Utc::now();
    validate_issue_session(&payload, now)?;

    let directory = state.tokens.directory();
    let (record, registered) = match directory.load(&payload.user_id).await? {
        Some(record) => (record, false),
        None => {
            let password_set_at = payload.password_changed_at.unwrap_or(now);
            let record = directory
                .register(&payload.user_id, &payload.email, password_set_at)
                .await?;
            (record, true)
        }
    };

    let token = state
        .tokens
        .issue(&payload.user_id, &payload.email)
        .await
        .map_err(token_error)?;
    info!(registered, token_version = record.token_version, "Session token issued");

    Ok((
        StatusCode::CREATED,
        Json(IssuedSessionResponse {
            token,
            user_id: record.user_id,
            token_version: record.token_version,
            expires_in_secs: state.config.jwt_expires_in.as_secs(),
            registered,
        }),
    ))
}

/// Record a password change, revoking tokens issued before it.
#[instrument(skip(state))]
pub async fn password_changed(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<StatusCode> {
    validate_user_id(&user_id)?;
    let directory = state.tokens.directory();
    if directory.load(&user_id).await?.is_none() {
        return Err(AppError::NotFound(format!("User '{user_id}' not found")));
    }
    directory.record_password_change(&user_id, Utc::now()).await?;
    info!("Password change recorded");
    Ok(StatusCode::NO_CONTENT)
}
