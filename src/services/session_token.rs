//! HMAC-signed session tokens with server-side revocation.
//!
//! A token carries the user's `tokenVersion` and `passwordChangedAt` as of
//! issuance. Verification checks signature and expiry first, then compares
//! both claims against the live [`UserDirectory`] record:
//!
//! - `tokenVersion` must equal the user's current version, so bumping the
//!   version revokes every outstanding token;
//! - `passwordChangedAt` must not precede the user's last password change.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, get_current_timestamp,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use super::users::UserDirectory;
use crate::error::TokenError;
use crate::metrics;

pub const MIN_SECRET_LEN: usize = 32;

/// Default lifetime of an issued token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Well-known sample values that must never sign real tokens.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "secret",
    "changeme",
    "change-me",
    "your-secret-key",
    "your-jwt-secret",
    "your_jwt_secret",
    "your-jwt-secret-key",
    "jwt-secret",
    "default-secret",
    "your-super-secret-jwt-key-change-this-in-production",
    "your-secret-key-change-in-production",
    "please-change-this-secret-key-in-production",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("JWT_SECRET is not set")]
    Missing,
    #[error("JWT_SECRET is a known placeholder value")]
    Placeholder,
    #[error("JWT_SECRET must be at least {MIN_SECRET_LEN} characters (got {0})")]
    TooShort(usize),
}

/// Validated signing secret. Never printed.
#[derive(Clone)]
pub struct JwtSecret(String);

impl JwtSecret {
    pub fn new(raw: impl Into<String>) -> Result<Self, SecretError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SecretError::Missing);
        }
        if PLACEHOLDER_SECRETS
            .iter()
            .any(|p| p.eq_ignore_ascii_case(trimmed))
        {
            return Err(SecretError::Placeholder);
        }
        let len = trimmed.chars().count();
        if len < MIN_SECRET_LEN {
            return Err(SecretError::TooShort(len));
        }
        Ok(Self(raw))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for JwtSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JwtSecret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub user_id: String,
    pub email: String,
    pub token_version: u64,
    pub password_changed_at: DateTime<Utc>,
    /// Issued at, seconds since the epoch.
    pub iat: u64,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
}

#[derive(Clone)]
pub struct SessionTokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
    directory: Arc<dyn UserDirectory>,
}

impl SessionTokenService {
    /// # Errors
    ///
    /// Fails if `secret` does not pass [`JwtSecret::new`] checks.
    pub fn new(
        secret: &str,
        ttl: Duration,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self, SecretError> {
        let secret = JwtSecret::new(secret)?;
        Ok(Self::from_secret(&secret, ttl, directory))
    }

    pub fn from_secret(
        secret: &JwtSecret,
        ttl: Duration,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_nbf = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
            directory,
        }
    }

    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.directory
    }

    /// Mint a token reflecting the user's current session state.
    #[instrument(skip(self, email))]
    pub async fn issue(&self, user_id: &str, email: &str) -> Result<String, TokenError> {
        let user = self
            .directory
            .load(user_id)
            .await?
            .ok_or(TokenError::UnknownUser)?;
        let iat = get_current_timestamp();
        let claims = SessionClaims {
            user_id: user.user_id,
            email: email.to_string(),
            token_version: user.token_version,
            password_changed_at: user.password_changed_at,
            iat,
            exp: iat.saturating_add(self.ttl.as_secs()),
        };
        self.sign(&claims)
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &SessionClaims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Verify `token` cryptographically, then against the user's live record.
    pub async fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let result = self.verify_inner(token).await;
        metrics::record_token_verification(match &result {
            Ok(_) => "valid",
            Err(e) => e.kind(),
        });
        result
    }

    async fn verify_inner(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let claims = decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::ImmatureSignature => TokenError::NotYetValid,
                _ => TokenError::Malformed(e.to_string()),
            })?
            .claims;

        if claims.iat > get_current_timestamp() {
            return Err(TokenError::NotYetValid);
        }

        let user = self
            .directory
            .load(&claims.user_id)
            .await?
            .ok_or(TokenError::UnknownUser)?;

        if claims.token_version != user.token_version {
            debug!(user_id = %claims.user_id, "Token version superseded");
            return Err(TokenError::VersionMismatch {
                token: claims.token_version,
                current: user.token_version,
            });
        }
        if claims.password_changed_at < user.password_changed_at {
            debug!(user_id = %claims.user_id, "Token predates password change");
            return Err(TokenError::PasswordChanged);
        }

        Ok(claims)
    }
}
