//! Authoritative per-user session state consulted on token verification.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::{RateLimitStore, keys};

const EMAIL: &str = "email";
const TOKEN_VERSION: &str = "token_version";
const PASSWORD_CHANGED_AT: &str = "password_changed_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAuthRecord {
    pub user_id: String,
    pub email: String,
    pub token_version: u64,
    pub password_changed_at: DateTime<Utc>,
}

/// Stored timestamps keep millisecond precision.
pub fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn load(&self, user_id: &str) -> StoreResult<Option<UserAuthRecord>>;

    /// Create or reset a user's session state.
    async fn register(
        &self,
        user_id: &str,
        email: &str,
        password_set_at: DateTime<Utc>,
    ) -> StoreResult<UserAuthRecord>;

    /// Invalidate every token issued so far. Returns the new version, or 0
    /// for an unknown user (nothing is created).
    async fn revoke_all_sessions(&self, user_id: &str) -> StoreResult<u64>;

    async fn record_password_change(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()>;
}

/// [`UserDirectory`] kept in `user_auth:{userId}` hashes of the shared store.
#[derive(Clone)]
pub struct StoreUserDirectory {
    store: Arc<dyn RateLimitStore>,
}

impl StoreUserDirectory {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }
}

fn decode(
    user_id: &str,
    key: &str,
    raw: &HashMap<String, String>,
) -> StoreResult<UserAuthRecord> {
    let malformed = |reason: String| StoreError::Malformed {
        key: key.to_string(),
        reason,
    };
    let email = raw
        .get(EMAIL)
        .cloned()
        .ok_or_else(|| malformed("missing field `email`".to_string()))?;
    let token_version = raw
        .get(TOKEN_VERSION)
        .ok_or_else(|| malformed("missing field `token_version`".to_string()))?
        .parse::<u64>()
        .map_err(|e| malformed(format!("field `token_version`: {e}")))?;
    let password_changed_at = raw
        .get(PASSWORD_CHANGED_AT)
        .ok_or_else(|| malformed("missing field `password_changed_at`".to_string()))
        .and_then(|v| {
            DateTime::parse_from_rfc3339(v)
                .map_err(|e| malformed(format!("field `password_changed_at`: {e}")))
        })?
        .with_timezone(&Utc);

    Ok(UserAuthRecord {
        user_id: user_id.to_string(),
        email,
        token_version,
        password_changed_at,
    })
}

#[async_trait]
impl UserDirectory for StoreUserDirectory {
    async fn load(&self, user_id: &str) -> StoreResult<Option<UserAuthRecord>> {
        let key = keys::user_auth(user_id);
        let raw = self.store.hash_get_all(&key).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        decode(user_id, &key, &raw).map(Some)
    }

    async fn register(
        &self,
        user_id: &str,
        email: &str,
        password_set_at: DateTime<Utc>,
    ) -> StoreResult<UserAuthRecord> {
        let record = UserAuthRecord {
            user_id: user_id.to_string(),
            email: email.to_string(),
            token_version: 1,
            password_changed_at: truncate_to_millis(password_set_at),
        };
        self.store
            .hash_set(
                &keys::user_auth(user_id),
                &[
                    (EMAIL, record.email.clone()),
                    (TOKEN_VERSION, record.token_version.to_string()),
                    (
                        PASSWORD_CHANGED_AT,
                        record
                            .password_changed_at
                            .to_rfc3339_opts(SecondsFormat::Millis, true),
                    ),
                ],
            )
            .await?;
        Ok(record)
    }

    async fn revoke_all_sessions(&self, user_id: &str) -> StoreResult<u64> {
        let key = keys::user_auth(user_id);
        if !self.store.exists(&key).await? {
            warn!(user_id, "Revoke requested for unknown user");
            return Ok(0);
        }
        let version = self.store.hash_incr(&key, TOKEN_VERSION, 1).await?;
        info!(user_id, version, "All sessions revoked");
        Ok(u64::try_from(version).unwrap_or(0))
    }

    async fn record_password_change(&self, user_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.store
            .hash_set(
                &keys::user_auth(user_id),
                &[(
                    PASSWORD_CHANGED_AT,
                    truncate_to_millis(at).to_rfc3339_opts(SecondsFormat::Millis, true),
                )],
            )
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn directory() -> (StoreUserDirectory, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (StoreUserDirectory::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_register_and_load() {
        let (dir, _) = directory();
        let at = DateTime::parse_from_rfc3339("2024-01-15T10:30:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        dir.register("u1", "a@example.com", at).await.unwrap();

        let user = dir.load("u1").await.unwrap().unwrap();
        assert_eq!(user.email, "a@example.com");
        assert_eq!(user.token_version, 1);
        assert_eq!(user.password_changed_at.timestamp_millis(), at.timestamp_millis());
        assert!(dir.load("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_bumps_version() {
        let (dir, _) = directory();
        dir.register("u1", "a@example.com", Utc::now()).await.unwrap();
        assert_eq!(dir.revoke_all_sessions("u1").await.unwrap(), 2);
        assert_eq!(dir.revoke_all_sessions("u1").await.unwrap(), 3);
        assert_eq!(dir.load("u1").await.unwrap().unwrap().token_version, 3);
    }

    #[tokio::test]
    async fn test_revoke_unknown_user_creates_nothing() {
        let (dir, _) = directory();
        assert_eq!(dir.revoke_all_sessions("ghost").await.unwrap(), 0);
        assert!(dir.load("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_record_is_rejected() {
        let (dir, store) = directory();
        store
            .hash_set(
                &keys::user_auth("u2"),
                &[("email", "b@example.com".to_string())],
            )
            .await
            .unwrap();
        assert!(matches!(
            dir.load("u2").await,
            Err(StoreError::Malformed { .. })
        ));
    }
}
