//! Shared key-value store used for counters, windows, bans and trusted IPs.
//!
//! # Strategies
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ GuardedStore (round-trip timeout + circuit breaker)    │
//! ├───────────────────────────┬────────────────────────────┤
//! │ RedisStore                │ MemoryStore                │
//! │ multi-instance, shared    │ single instance, tests     │
//! └───────────────────────────┴────────────────────────────┘
//! ```
//!
//! The strategy is chosen once when the service graph is built and every
//! component holds it as `Arc<dyn RateLimitStore>`.
//!
//! # Atomicity
//!
//! Counter mutations (`hash_incr`, `incr_with_ttl`) are single store-side
//! operations. Callers never read a counter, modify it and write it back.
//! `hash_replace` swaps a whole hash and its TTL in one step.

mod circuit_breaker;
mod guarded;
mod memory;
mod redis_store;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use guarded::GuardedStore;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Atomic hash / counter / sorted-set storage with TTLs.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Name of the backend, for health output and logs.
    fn backend(&self) -> &'static str;

    /// All fields of a hash. Missing keys yield an empty map.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Set several hash fields at once.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()>;

    /// Replace the whole hash with `fields` and set its TTL in one step.
    /// Readers see either the previous hash or the new one, never neither.
    async fn hash_replace(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    /// Atomically add `delta` to an integer hash field, returning the new value.
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    /// Set (or refresh) the TTL of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomically increment a counter and set its TTL, returning the new value.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// Current value of a counter; 0 when missing.
    async fn counter_get(&self, key: &str) -> StoreResult<i64>;

    /// Store an existence flag that disappears after `ttl`.
    async fn set_flag(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Remaining lifetime of a key; `None` when missing or persistent.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Delete a key, returning whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Add a member to a sorted set.
    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Drop members scored below `min_score`, then keep at most `max_len`
    /// highest-scored members.
    async fn sorted_prune(&self, key: &str, min_score: f64, max_len: usize) -> StoreResult<()>;

    /// Scores of the `count` highest-scored members, ascending.
    async fn sorted_tail_scores(&self, key: &str, count: usize) -> StoreResult<Vec<f64>>;

    /// Keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Logical key schema, independent of the backend.
pub mod keys {
    pub const USER_METRICS_PREFIX: &str = "user_metrics:";
    pub const REQUEST_TIMES_PREFIX: &str = "request_times:";
    pub const TRUSTED_IP_PREFIX: &str = "trusted_ip:";
    pub const BAN_PREFIX: &str = "ban:";
    pub const TRUSTED_IP_RATE_PREFIX: &str = "trusted_ip_rate:";
    pub const RATE_LIMIT_PREFIX: &str = "rate_limit:";
    pub const USER_AUTH_PREFIX: &str = "user_auth:";

    pub fn user_metrics(id: &str) -> String {
        format!("{USER_METRICS_PREFIX}{id}")
    }

    pub fn request_times(id: &str) -> String {
        format!("{REQUEST_TIMES_PREFIX}{id}")
    }

    pub fn trusted_ip(ip: &str) -> String {
        format!("{TRUSTED_IP_PREFIX}{ip}")
    }

    pub fn ban(id: &str) -> String {
        format!("{BAN_PREFIX}{id}")
    }

    pub fn trusted_ip_rate(ip: &str, minute_bucket: u64) -> String {
        format!("{TRUSTED_IP_RATE_PREFIX}{ip}:{minute_bucket}")
    }

    pub fn rate_limit_window(id: &str, window_ms: u64, window_index: u64) -> String {
        format!("{RATE_LIMIT_PREFIX}{id}:{window_ms}:{window_index}")
    }

    pub fn user_auth(user_id: &str) -> String {
        format!("{USER_AUTH_PREFIX}{user_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn test_key_schema() {
        assert_eq!(keys::user_metrics("1.2.3.4"), "user_metrics:1.2.3.4");
        assert_eq!(keys::request_times("u1"), "request_times:u1");
        assert_eq!(keys::trusted_ip("10.0.0.1"), "trusted_ip:10.0.0.1");
        assert_eq!(keys::ban("u1"), "ban:u1");
        assert_eq!(
            keys::trusted_ip_rate("10.0.0.1", 28_333_333),
            "trusted_ip_rate:10.0.0.1:28333333"
        );
        assert_eq!(
            keys::rate_limit_window("u1", 60_000, 7),
            "rate_limit:u1:60000:7"
        );
    }
}
