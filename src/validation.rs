//! Validation of admin payloads before they reach the trusted-IP registry.

use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult};
use crate::models::{AddTrustedIpRequest, IssueSessionRequest};
use crate::services::TrustedIpConfig;
use crate::services::trusted_ips::{canonical_ip, normalize_ip};

// =============================================================================
// Validation Constants
// =============================================================================

/// Maximum length of a trusted-IP description.
pub const MAX_DESCRIPTION_LENGTH: usize = 256;

/// Maximum length of the `addedBy` field.
pub const MAX_ADDED_BY_LENGTH: usize = 128;

/// Maximum number of endpoint patterns per entry.
pub const MAX_ENDPOINT_PATTERNS: usize = 64;

/// Maximum length of one endpoint pattern.
pub const MAX_ENDPOINT_PATTERN_LENGTH: usize = 256;

/// Maximum length of a user id.
pub const MAX_USER_ID_LENGTH: usize = 128;

/// Maximum length of an email address.
pub const MAX_EMAIL_LENGTH: usize = 254;

/// Bounds of a custom per-minute quota.
pub const MIN_REQUESTS_PER_MINUTE: u32 = 1;
pub const MAX_REQUESTS_PER_MINUTE: u32 = 100_000;

/// Recorded when the request names no operator.
pub const DEFAULT_ADDED_BY: &str = "admin";

/// Validate an address and return its canonical form.
///
/// IPv6-mapped IPv4 is accepted and reported as IPv4.
pub fn validate_ip_address(raw: &str) -> AppResult<String> {
    if normalize_ip(raw).parse::<IpAddr>().is_err() {
        return Err(AppError::BadRequest(format!(
            "'{}' is not a valid IP address",
            raw.trim()
        )));
    }
    Ok(canonical_ip(raw))
}

/// Validate a free-text description.
///
/// Rules:
/// - 1 to 256 characters after trimming
/// - No control characters
pub fn validate_description(description: &str) -> AppResult<()> {
    let description = description.trim();
    if description.is_empty() {
        return Err(AppError::BadRequest(
            "Description cannot be empty".to_string(),
        ));
    }
    if description.chars().count() > MAX_DESCRIPTION_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Description cannot exceed {MAX_DESCRIPTION_LENGTH} characters"
        )));
    }
    if let Some(c) = description.chars().find(|c| c.is_control()) {
        return Err(AppError::BadRequest(format!(
            "Description contains control character {:?}",
            c
        )));
    }
    Ok(())
}

fn validate_added_by(added_by: &str) -> AppResult<()> {
    if added_by.is_empty() {
        return Err(AppError::BadRequest("addedBy cannot be empty".to_string()));
    }
    if added_by.chars().count() > MAX_ADDED_BY_LENGTH {
        return Err(AppError::BadRequest(format!(
            "addedBy cannot exceed {MAX_ADDED_BY_LENGTH} characters"
        )));
    }
    if added_by.chars().any(char::is_control) {
        return Err(AppError::BadRequest(
            "addedBy cannot contain control characters".to_string(),
        ));
    }
    Ok(())
}

/// Characters allowed in a URL path segment, plus `*` for globbing.
fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '/' | '-' | '.' | '_' | '~' | '!' | '$' | '&' | '\'' | '(' | ')' | '*' | '+' | ','
                | ';' | '=' | ':' | '@' | '%'
        )
}

/// Validate endpoint glob patterns.
///
/// Rules:
/// - At most 64 patterns
/// - Each starts with `/` and is at most 256 characters
/// - Only URL path characters and `*`
pub fn validate_endpoint_patterns(patterns: &[String]) -> AppResult<()> {
    if patterns.len() > MAX_ENDPOINT_PATTERNS {
        return Err(AppError::BadRequest(format!(
            "At most {MAX_ENDPOINT_PATTERNS} endpoint patterns are allowed"
        )));
    }
    for (i, pattern) in patterns.iter().enumerate() {
        if !pattern.starts_with('/') {
            return Err(AppError::BadRequest(format!(
                "Endpoint pattern {i} must start with '/'"
            )));
        }
        if pattern.len() > MAX_ENDPOINT_PATTERN_LENGTH {
            return Err(AppError::BadRequest(format!(
                "Endpoint pattern {i} cannot exceed {MAX_ENDPOINT_PATTERN_LENGTH} characters"
            )));
        }
        if let Some(c) = pattern.chars().find(|c| !is_path_char(*c)) {
            return Err(AppError::BadRequest(format!(
                "Endpoint pattern {i} contains invalid character '{c}'"
            )));
        }
    }
    Ok(())
}

/// Validate a custom per-minute quota.
pub fn validate_requests_per_minute(limit: u32) -> AppResult<()> {
    if !(MIN_REQUESTS_PER_MINUTE..=MAX_REQUESTS_PER_MINUTE).contains(&limit) {
        return Err(AppError::BadRequest(format!(
            "maxRequestsPerMinute must be between {MIN_REQUESTS_PER_MINUTE} and {MAX_REQUESTS_PER_MINUTE}"
        )));
    }
    Ok(())
}

/// User ids are opaque but printable, and key the `user_auth:` hash.
pub fn validate_user_id(user_id: &str) -> AppResult<()> {
    if user_id.is_empty() {
        return Err(AppError::BadRequest("userId cannot be empty".to_string()));
    }
    if user_id.chars().count() > MAX_USER_ID_LENGTH {
        return Err(AppError::BadRequest(format!(
            "userId cannot exceed {MAX_USER_ID_LENGTH} characters"
        )));
    }
    if user_id.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(AppError::BadRequest(
            "userId cannot contain whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> AppResult<()> {
    if email.len() > MAX_EMAIL_LENGTH {
        return Err(AppError::BadRequest(format!(
            "email cannot exceed {MAX_EMAIL_LENGTH} characters"
        )));
    }
    let well_formed = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
        && !email.chars().any(|c| c.is_control() || c.is_whitespace());
    if !well_formed {
        return Err(AppError::BadRequest("email is not a valid address".to_string()));
    }
    Ok(())
}

/// Validate a session issue request. A password change time in the future
/// is rejected, since it would revoke the token being issued.
pub fn validate_issue_session(request: &IssueSessionRequest, now: DateTime<Utc>) -> AppResult<()> {
    validate_user_id(&request.user_id)?;
    validate_email(&request.email)?;
    if request.password_changed_at.is_some_and(|at| at > now) {
        return Err(AppError::BadRequest(
            "passwordChangedAt cannot be in the future".to_string(),
        ));
    }
    Ok(())
}

/// Validate an add request and build the entry to store, stamped `now`.
pub fn validate_add_trusted_ip(
    request: AddTrustedIpRequest,
    now: DateTime<Utc>,
) -> AppResult<TrustedIpConfig> {
    let ip_address = validate_ip_address(&request.ip_address)?;
    validate_description(&request.description)?;

    let added_by = request
        .added_by
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| DEFAULT_ADDED_BY.to_string());
    validate_added_by(&added_by)?;

    if let Some(patterns) = &request.allowed_endpoints {
        validate_endpoint_patterns(patterns)?;
    }
    if let Some(limit) = request.max_requests_per_minute {
        validate_requests_per_minute(limit)?;
    }
    if let Some(expires_at) = request.expires_at
        && expires_at <= now
    {
        return Err(AppError::BadRequest(
            "expiresAt must be in the future".to_string(),
        ));
    }

    Ok(TrustedIpConfig {
        ip_address,
        description: request.description.trim().to_string(),
        expires_at: request.expires_at,
        allowed_endpoints: request.allowed_endpoints,
        max_requests_per_minute: request.max_requests_per_minute,
        added_by,
        added_at: now,
    })
}
