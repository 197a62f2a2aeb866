use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::{BehaviorMetrics, TrustCheck, TrustedIpConfig};

/// Request to register a dynamic trusted IP.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddTrustedIpRequest {
    pub ip_address: String,
    /// Why the address is trusted (1-256 characters)
    pub description: String,
    /// When the entry stops applying; must be in the future
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Path globs the address may reach (`*` matches anything)
    #[serde(default)]
    pub allowed_endpoints: Option<Vec<String>>,
    /// Custom per-minute quota for the address
    #[serde(default)]
    pub max_requests_per_minute: Option<u32>,
    /// Operator recorded on the entry (default: `admin`)
    #[serde(default)]
    pub added_by: Option<String>,
}

/// Dynamic entries plus the statically configured ranges.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedIpListResponse {
    pub count: usize,
    pub entries: Vec<TrustedIpConfig>,
    pub static_ranges: Vec<String>,
}

/// Diagnostics for one address.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustCheckResponse {
    pub ip: String,
    #[serde(flatten)]
    pub check: TrustCheck,
}

/// Behavior snapshot of one identifier.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierResponse {
    pub identifier: String,
    pub metrics: BehaviorMetrics,
    pub success_rate: Option<f64>,
    pub banned: bool,
    /// Seconds until the ban lapses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ban_expires_in_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiftBanResponse {
    pub identifier: String,
    /// Whether a ban was in force
    pub ban_lifted: bool,
}

/// Identity carried by a verified session token.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub user_id: String,
    pub email: String,
    pub token_version: u64,
    pub password_changed_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Operator request minting a session token, typically sent by the login
/// service once it has checked the user's credentials.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IssueSessionRequest {
    pub user_id: String,
    pub email: String,
    /// Last password change; only used to register an unknown user
    #[serde(default)]
    pub password_changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedSessionResponse {
    pub token: String,
    pub user_id: String,
    pub token_version: u64,
    pub expires_in_secs: u64,
    /// The user had no session record and was registered
    pub registered: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutAllResponse {
    pub user_id: String,
    /// Version every new token will carry
    pub token_version: u64,
    pub message: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` when the store does not answer
    pub status: String,
    /// Service version
    pub version: String,
    /// `redis` or `memory`
    pub store_backend: String,
    pub store_reachable: bool,
    /// Store circuit breaker state
    pub store_circuit: String,
    pub store_failure_policy: String,
    pub uptime_seconds: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}
