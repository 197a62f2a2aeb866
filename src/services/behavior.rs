//! Per-identifier behavior metrics.
//!
//! `user_metrics:{id}` holds one hash per identifier (client IP or user id):
//!
//! | field                 | type  | written by                          |
//! |-----------------------|-------|-------------------------------------|
//! | `total_requests`      | int   | tracker, atomic increment           |
//! | `successful_requests` | int   | tracker, atomic increment           |
//! | `failed_requests`     | int   | tracker, atomic increment           |
//! | `avg_response_time`   | float | tracker                             |
//! | `last_request_time`   | int   | tracker, epoch millis               |
//! | `last_user_agent`     | str   | tracker                             |
//! | `trust_score`         | float | limiter                             |
//! | `suspicion_score`     | float | limiter                             |
//! | `patterns`            | json  | limiter                             |
//! | `violations`          | int   | limiter, atomic increment           |
//!
//! The hash expires after seven days without traffic. `request_times:{id}`
//! keeps the most recent request timestamps for timing analysis.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use super::ClientSignals;
use super::patterns::TrafficPatterns;
use super::trust_score::Scores;
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::store::{RateLimitStore, keys};

/// Inactivity after which an identifier's metrics are dropped.
pub const METRICS_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Age limit of the request timestamp series.
pub const SERIES_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Length limit of the request timestamp series.
pub const SERIES_MAX_LEN: usize = 20;

pub mod fields {
    pub const TOTAL_REQUESTS: &str = "total_requests";
    pub const SUCCESSFUL_REQUESTS: &str = "successful_requests";
    pub const FAILED_REQUESTS: &str = "failed_requests";
    pub const AVG_RESPONSE_TIME: &str = "avg_response_time";
    pub const LAST_REQUEST_TIME: &str = "last_request_time";
    pub const LAST_USER_AGENT: &str = "last_user_agent";
    pub const TRUST_SCORE: &str = "trust_score";
    pub const SUSPICION_SCORE: &str = "suspicion_score";
    pub const PATTERNS: &str = "patterns";
    pub const VIOLATIONS: &str = "violations";
}

pub const INITIAL_TRUST: f64 = 50.0;

/// Decoded `user_metrics:{id}` record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time_ms: f64,
    /// Epoch millis of the latest recorded request.
    pub last_request_time: Option<u64>,
    pub last_user_agent: Option<String>,
    pub trust_score: f64,
    pub suspicion_score: f64,
    pub violations: u64,
    pub patterns: TrafficPatterns,
}

impl Default for BehaviorMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            avg_response_time_ms: 0.0,
            last_request_time: None,
            last_user_agent: None,
            trust_score: INITIAL_TRUST,
            suspicion_score: 0.0,
            violations: 0,
            patterns: TrafficPatterns::default(),
        }
    }
}

fn parse_field<T: FromStr>(
    key: &str,
    raw: &HashMap<String, String>,
    field: &str,
) -> StoreResult<Option<T>> {
    raw.get(field)
        .map(|value| {
            value.parse::<T>().map_err(|_| StoreError::Malformed {
                key: key.to_string(),
                reason: format!("field `{field}` has invalid value `{value}`"),
            })
        })
        .transpose()
}

impl BehaviorMetrics {
    /// Decode a stored hash. Absent fields take their defaults; present but
    /// unparsable fields reject the whole record.
    pub fn from_fields(key: &str, raw: &HashMap<String, String>) -> StoreResult<Self> {
        let defaults = Self::default();
        let patterns = match raw.get(fields::PATTERNS) {
            Some(json) => serde_json::from_str(json).map_err(|e| StoreError::Malformed {
                key: key.to_string(),
                reason: format!("field `patterns`: {e}"),
            })?,
            None => defaults.patterns,
        };

        Ok(Self {
            total_requests: parse_field(key, raw, fields::TOTAL_REQUESTS)?.unwrap_or(0),
            successful_requests: parse_field(key, raw, fields::SUCCESSFUL_REQUESTS)?.unwrap_or(0),
            failed_requests: parse_field(key, raw, fields::FAILED_REQUESTS)?.unwrap_or(0),
            avg_response_time_ms: parse_field(key, raw, fields::AVG_RESPONSE_TIME)?.unwrap_or(0.0),
            last_request_time: parse_field(key, raw, fields::LAST_REQUEST_TIME)?,
            last_user_agent: raw.get(fields::LAST_USER_AGENT).cloned(),
            trust_score: parse_field(key, raw, fields::TRUST_SCORE)?.unwrap_or(INITIAL_TRUST),
            suspicion_score: parse_field(key, raw, fields::SUSPICION_SCORE)?.unwrap_or(0.0),
            violations: parse_field(key, raw, fields::VIOLATIONS)?.unwrap_or(0),
            patterns,
        })
    }

    /// Fraction of successful requests, `None` before the first request.
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_requests > 0)
            .then(|| self.successful_requests as f64 / self.total_requests as f64)
    }
}

/// Incremental running mean over `n` samples, `n` counting the new one.
pub fn running_mean(avg: f64, n: u64, sample: f64) -> f64 {
    if n == 0 {
        return avg;
    }
    let n = n as f64;
    (avg * (n - 1.0) + sample) / n
}

/// Records request outcomes into the store.
#[derive(Clone)]
pub struct BehaviorTracker {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl BehaviorTracker {
    pub fn new(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Current metrics for `identifier`, defaults if none are stored.
    pub async fn load(&self, identifier: &str) -> StoreResult<BehaviorMetrics> {
        let key = keys::user_metrics(identifier);
        let raw = self.store.hash_get_all(&key).await?;
        BehaviorMetrics::from_fields(&key, &raw)
    }

    /// Fold one finished request into the identifier's metrics.
    ///
    /// Counters are incremented store-side. The average is derived from the
    /// value read before the increment, so concurrent writers may lose an
    /// average sample but never a count.
    #[instrument(skip(self, signals), fields(identifier = %identifier))]
    pub async fn record_outcome(
        &self,
        identifier: &str,
        success: bool,
        response_time_ms: f64,
        signals: ClientSignals<'_>,
    ) -> StoreResult<()> {
        let now = self.clock.now_ms();
        let key = keys::user_metrics(identifier);
        let previous = self.load(identifier).await?;

        let total = self
            .store
            .hash_incr(&key, fields::TOTAL_REQUESTS, 1)
            .await?;
        let outcome_field = if success {
            fields::SUCCESSFUL_REQUESTS
        } else {
            fields::FAILED_REQUESTS
        };
        self.store.hash_incr(&key, outcome_field, 1).await?;

        let avg = running_mean(
            previous.avg_response_time_ms,
            u64::try_from(total).unwrap_or(0),
            response_time_ms.max(0.0),
        );
        let mut updates = vec![
            (fields::AVG_RESPONSE_TIME, avg.to_string()),
            (fields::LAST_REQUEST_TIME, now.to_string()),
        ];
        if let Some(ua) = signals.user_agent.filter(|ua| !ua.is_empty()) {
            updates.push((fields::LAST_USER_AGENT, ua.to_string()));
        }
        self.store.hash_set(&key, &updates).await?;
        self.store.expire(&key, METRICS_RETENTION).await?;

        let series = keys::request_times(identifier);
        self.store
            .sorted_add(&series, &format!("{now}-{}", Uuid::new_v4()), now as f64)
            .await?;
        let floor = now.saturating_sub(SERIES_RETENTION.as_millis() as u64);
        self.store
            .sorted_prune(&series, floor as f64, SERIES_MAX_LEN)
            .await?;
        self.store.expire(&series, SERIES_RETENTION).await
    }

    /// Persist the limiter's latest assessment for `identifier`.
    pub async fn save_assessment(
        &self,
        identifier: &str,
        scores: Scores,
        patterns: &TrafficPatterns,
    ) -> StoreResult<()> {
        let key = keys::user_metrics(identifier);
        let patterns = serde_json::to_string(patterns).map_err(|e| StoreError::Malformed {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store
            .hash_set(
                &key,
                &[
                    (fields::TRUST_SCORE, scores.trust.to_string()),
                    (fields::SUSPICION_SCORE, scores.suspicion.to_string()),
                    (fields::PATTERNS, patterns),
                ],
            )
            .await?;
        self.store.expire(&key, METRICS_RETENTION).await
    }

    /// Up to `count` most recent request timestamps, oldest first.
    pub async fn recent_request_times(
        &self,
        identifier: &str,
        count: usize,
    ) -> StoreResult<Vec<f64>> {
        self.store
            .sorted_tail_scores(&keys::request_times(identifier), count)
            .await
    }
}
