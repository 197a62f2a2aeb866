//! Timeout and circuit-breaker decorator for any store strategy.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use super::{CircuitBreaker, CircuitBreakerConfig, RateLimitStore};
use crate::error::{StoreError, StoreResult};
use crate::metrics;

/// Bounds every round trip to the wrapped store by `timeout` and stops
/// calling it while the circuit breaker is open.
#[derive(Clone)]
pub struct GuardedStore {
    inner: Arc<dyn RateLimitStore>,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for GuardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedStore")
            .field("backend", &self.inner.backend())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GuardedStore {
    pub fn new(
        inner: Arc<dyn RateLimitStore>,
        timeout: Duration,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            inner,
            timeout,
            breaker: Arc::new(CircuitBreaker::new(breaker)),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guard<T, F>(&self, op: &'static str, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>> + Send,
    {
        if !self.breaker.allow().await {
            return Err(StoreError::CircuitOpen);
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op,
                after: self.timeout,
            }),
        };
        metrics::record_store_operation(
            op,
            self.inner.backend(),
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        match &result {
            Ok(_) => self.breaker.on_success().await,
            Err(e) => {
                warn!(op, backend = self.inner.backend(), error = %e, "Store operation failed");
                self.breaker.on_failure().await;
            }
        }
        result
    }
}

#[async_trait]
impl RateLimitStore for GuardedStore {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.guard("hash_get_all", self.inner.hash_get_all(key)).await
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        self.guard("hash_set", self.inner.hash_set(key, fields)).await
    }

    async fn hash_replace(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        self.guard("hash_replace", self.inner.hash_replace(key, fields, ttl))
            .await
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.guard("hash_incr", self.inner.hash_incr(key, field, delta))
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.guard("expire", self.inner.expire(key, ttl)).await
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.guard("incr_with_ttl", self.inner.incr_with_ttl(key, ttl))
            .await
    }

    async fn counter_get(&self, key: &str) -> StoreResult<i64> {
        self.guard("counter_get", self.inner.counter_get(key)).await
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.guard("set_flag", self.inner.set_flag(key, ttl)).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.guard("exists", self.inner.exists(key)).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.guard("ttl", self.inner.ttl(key)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.guard("delete", self.inner.delete(key)).await
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.guard("sorted_add", self.inner.sorted_add(key, member, score))
            .await
    }

    async fn sorted_prune(&self, key: &str, min_score: f64, max_len: usize) -> StoreResult<()> {
        self.guard(
            "sorted_prune",
            self.inner.sorted_prune(key, min_score, max_len),
        )
        .await
    }

    async fn sorted_tail_scores(&self, key: &str, count: usize) -> StoreResult<Vec<f64>> {
        self.guard(
            "sorted_tail_scores",
            self.inner.sorted_tail_scores(key, count),
        )
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.guard("keys_with_prefix", self.inner.keys_with_prefix(prefix))
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.guard("ping", self.inner.ping()).await
    }
}
