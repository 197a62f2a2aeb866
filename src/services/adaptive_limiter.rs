//! Behavior-adaptive rate limiting.
//!
//! Each identifier gets a quota derived from its scores:
//!
//! - trust above `trust_threshold`: `max_requests * trust_bonus_multiplier`
//! - otherwise suspicion above `suspicion_threshold`:
//!   `max_requests / suspicion_penalty_divisor` over a doubled window
//! - then, for more than 100 requests at a success rate above 0.95,
//!   `+ burst_allowance`
//!
//! Requests are counted in buckets one policy window wide
//! (`rate_limit:{id}:{windowMs}:{index}`) with a store-side increment. A
//! doubled window sums the aligned buckets it covers, so a score change never
//! hands out a fresh count. Each denial is a violation; more than
//! `ban_threshold` violations impose a ban flag that is checked before any
//! scoring work.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::ClientSignals;
use super::behavior::{BehaviorMetrics, BehaviorTracker, METRICS_RETENTION, fields};
use super::patterns::PatternAnalyzer;
use super::trust_score::{self, Scores};
use crate::clock::Clock;
use crate::error::StoreResult;
use crate::metrics;
use crate::store::{RateLimitStore, keys};

const BURST_MIN_REQUESTS: u64 = 100;
const BURST_MIN_SUCCESS_RATE: f64 = 0.95;
/// How much a suspicious identifier's window is stretched.
const SUSPICIOUS_WINDOW_FACTOR: u64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptivePolicy {
    pub window_ms: u64,
    pub max_requests: u64,
    pub trust_threshold: f64,
    pub suspicion_threshold: f64,
    pub trust_bonus_multiplier: f64,
    pub suspicion_penalty_divisor: f64,
    pub burst_allowance: u64,
    /// Violations above this count impose a ban.
    pub ban_threshold: u64,
    pub ban_duration: Duration,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            window_ms: 15 * 60 * 1000,
            max_requests: 100,
            trust_threshold: 70.0,
            suspicion_threshold: 50.0,
            trust_bonus_multiplier: 2.0,
            suspicion_penalty_divisor: 2.0,
            burst_allowance: 50,
            ban_threshold: 10,
            ban_duration: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveLimit {
    pub window_ms: u64,
    pub max_requests: u64,
}

impl AdaptivePolicy {
    /// Quota for an identifier with the given metrics and fresh scores.
    pub fn limit_for(&self, metrics: &BehaviorMetrics, scores: Scores) -> EffectiveLimit {
        let mut window_ms = self.window_ms;
        let mut max = self.max_requests as f64;

        if scores.trust > self.trust_threshold {
            max *= self.trust_bonus_multiplier;
        } else if scores.suspicion > self.suspicion_threshold {
            max /= self.suspicion_penalty_divisor;
            window_ms = window_ms.saturating_mul(SUSPICIOUS_WINDOW_FACTOR);
        }

        let mut max_requests = max.floor() as u64;
        if metrics.total_requests > BURST_MIN_REQUESTS
            && metrics
                .success_rate()
                .is_some_and(|rate| rate > BURST_MIN_SUCCESS_RATE)
        {
            max_requests = max_requests.saturating_add(self.burst_allowance);
        }

        EffectiveLimit {
            window_ms: window_ms.max(1),
            max_requests: max_requests.max(1),
        }
    }
}

/// Outcome of [`AdaptiveLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed {
        limit: EffectiveLimit,
        remaining: u64,
        reset_after: Duration,
    },
    Limited {
        limit: EffectiveLimit,
        retry_after: Duration,
        /// This denial pushed the identifier over the ban threshold.
        banned_now: bool,
    },
    Banned {
        retry_after: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationOutcome {
    pub violations: u64,
    pub banned: bool,
}

struct WindowCount {
    total: u64,
    window_end_ms: u64,
}

#[derive(Clone)]
pub struct AdaptiveLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    tracker: BehaviorTracker,
    analyzer: PatternAnalyzer,
    policy: AdaptivePolicy,
}

impl AdaptiveLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        tracker: BehaviorTracker,
        analyzer: PatternAnalyzer,
        policy: AdaptivePolicy,
    ) -> Self {
        Self {
            store,
            clock,
            tracker,
            analyzer,
            policy,
        }
    }

    pub fn policy(&self) -> &AdaptivePolicy {
        &self.policy
    }

    pub fn tracker(&self) -> &BehaviorTracker {
        &self.tracker
    }

    pub async fn is_banned(&self, identifier: &str) -> StoreResult<bool> {
        self.store.exists(&keys::ban(identifier)).await
    }

    /// Remaining ban time, `None` when not banned.
    pub async fn ban_remaining(&self, identifier: &str) -> StoreResult<Option<Duration>> {
        let key = keys::ban(identifier);
        if !self.store.exists(&key).await? {
            return Ok(None);
        }
        Ok(Some(
            self.store
                .ttl(&key)
                .await?
                .unwrap_or(self.policy.ban_duration),
        ))
    }

    /// Score `identifier` for the current request, persist the scores and
    /// derive its quota.
    pub async fn effective_limit(
        &self,
        identifier: &str,
        signals: ClientSignals<'_>,
    ) -> StoreResult<EffectiveLimit> {
        let mut metrics = self.tracker.load(identifier).await?;
        metrics.patterns = self.analyzer.analyze(identifier, signals).await?;
        let scores = trust_score::score(&metrics, self.clock.now_ms());
        self.tracker
            .save_assessment(identifier, scores, &metrics.patterns)
            .await?;

        let limit = self.policy.limit_for(&metrics, scores);
        debug!(
            identifier,
            trust = scores.trust,
            suspicion = scores.suspicion,
            max_requests = limit.max_requests,
            window_ms = limit.window_ms,
            "Effective limit computed"
        );
        Ok(limit)
    }

    /// Count one violation and ban the identifier past the threshold.
    pub async fn record_violation(&self, identifier: &str) -> StoreResult<ViolationOutcome> {
        let key = keys::user_metrics(identifier);
        let violations = self.store.hash_incr(&key, fields::VIOLATIONS, 1).await?;
        self.store.expire(&key, METRICS_RETENTION).await?;
        metrics::record_violation();

        let violations = u64::try_from(violations).unwrap_or(0);
        let banned = violations > self.policy.ban_threshold;
        if banned {
            self.store
                .set_flag(&keys::ban(identifier), self.policy.ban_duration)
                .await?;
            metrics::record_ban();
            warn!(
                identifier,
                violations,
                ban_secs = self.policy.ban_duration.as_secs(),
                "Identifier banned"
            );
        }
        Ok(ViolationOutcome { violations, banned })
    }

    /// Lift a ban and reset the violation count. Returns whether a ban existed.
    pub async fn lift_ban(&self, identifier: &str) -> StoreResult<bool> {
        let lifted = self.store.delete(&keys::ban(identifier)).await?;
        let key = keys::user_metrics(identifier);
        if self.store.exists(&key).await? {
            self.store
                .hash_set(&key, &[(fields::VIOLATIONS, "0".to_string())])
                .await?;
        }
        Ok(lifted)
    }

    /// Count one request in the current bucket and sum the buckets of the
    /// effective window.
    async fn count_request(
        &self,
        identifier: &str,
        limit: &EffectiveLimit,
        now: u64,
    ) -> StoreResult<WindowCount> {
        let base = self.policy.window_ms.max(1);
        let span = limit.window_ms.div_ceil(base).max(1);
        let bucket = now / base;
        let first = bucket - bucket % span;
        // must outlive the widest window a bucket can be summed into
        let retention = base
            .saturating_mul(SUSPICIOUS_WINDOW_FACTOR)
            .max(limit.window_ms);

        let key = keys::rate_limit_window(identifier, base, bucket);
        let mut total = self
            .store
            .incr_with_ttl(&key, Duration::from_millis(retention))
            .await?;
        for earlier in first..bucket {
            let key = keys::rate_limit_window(identifier, base, earlier);
            total = total.saturating_add(self.store.counter_get(&key).await?);
        }
        Ok(WindowCount {
            total: u64::try_from(total).unwrap_or(0),
            window_end_ms: first.saturating_add(span).saturating_mul(base),
        })
    }

    /// Admit or deny one request from `identifier`.
    #[instrument(skip(self, signals), fields(identifier = %identifier))]
    pub async fn check(
        &self,
        identifier: &str,
        signals: ClientSignals<'_>,
    ) -> StoreResult<LimitDecision> {
        if let Some(retry_after) = self.ban_remaining(identifier).await? {
            return Ok(LimitDecision::Banned { retry_after });
        }

        let limit = self.effective_limit(identifier, signals).await?;
        let now = self.clock.now_ms();
        let window = self.count_request(identifier, &limit, now).await?;
        let reset_after = Duration::from_millis(window.window_end_ms.saturating_sub(now));
        let count = window.total;

        if count > limit.max_requests {
            let violation = self.record_violation(identifier).await?;
            let retry_after = if violation.banned {
                self.policy.ban_duration
            } else {
                reset_after
            };
            return Ok(LimitDecision::Limited {
                limit,
                retry_after,
                banned_now: violation.banned,
            });
        }

        Ok(LimitDecision::Allowed {
            limit,
            remaining: limit.max_requests - count,
            reset_after,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::services::TrafficPatterns;
    use crate::store::MemoryStore;

    fn limiter(policy: AdaptivePolicy) -> (AdaptiveLimiter, ManualClock) {
        let clock = ManualClock::default();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store: Arc<dyn RateLimitStore> = Arc::new(MemoryStore::with_clock(clock_arc.clone()));
        let tracker = BehaviorTracker::new(store.clone(), clock_arc.clone());
        let analyzer = PatternAnalyzer::new(tracker.clone());
        (
            AdaptiveLimiter::new(store, clock_arc, tracker, analyzer, policy),
            clock,
        )
    }

    fn metrics(total: u64, ok: u64) -> BehaviorMetrics {
        BehaviorMetrics {
            total_requests: total,
            successful_requests: ok,
            failed_requests: total - ok,
            ..BehaviorMetrics::default()
        }
    }

    const NEUTRAL: Scores = Scores {
        trust: 55.0,
        suspicion: 0.0,
    };

    #[test]
    fn test_base_policy_for_neutral_identifier() {
        let policy = AdaptivePolicy::default();
        let limit = policy.limit_for(&metrics(0, 0), NEUTRAL);
        assert_eq!(
            limit,
            EffectiveLimit {
                window_ms: 900_000,
                max_requests: 100
            }
        );
    }

    #[test]
    fn test_trusted_identifier_gets_bonus() {
        let policy = AdaptivePolicy::default();
        let scores = Scores {
            trust: 85.0,
            suspicion: 60.0,
        };
        let limit = policy.limit_for(&metrics(20, 20), scores);
        assert_eq!(limit.max_requests, 200);
        assert_eq!(limit.window_ms, 900_000);
    }

    #[test]
    fn test_suspicious_identifier_is_penalized() {
        let policy = AdaptivePolicy::default();
        let scores = Scores {
            trust: 20.0,
            suspicion: 65.0,
        };
        let limit = policy.limit_for(&metrics(20, 5), scores);
        assert_eq!(limit.max_requests, 50);
        assert_eq!(limit.window_ms, 1_800_000);
    }

    #[test]
    fn test_burst_composes_with_trust_bonus() {
        let policy = AdaptivePolicy::default();
        let scores = Scores {
            trust: 90.0,
            suspicion: 0.0,
        };
        let limit = policy.limit_for(&metrics(200, 196), scores);
        assert_eq!(limit.max_requests, 250);
    }

    #[test]
    fn test_quota_never_drops_to_zero() {
        let policy = AdaptivePolicy {
            max_requests: 1,
            suspicion_penalty_divisor: 4.0,
            ..AdaptivePolicy::default()
        };
        let scores = Scores {
            trust: 0.0,
            suspicion: 100.0,
        };
        assert_eq!(policy.limit_for(&metrics(0, 0), scores).max_requests, 1);
    }

    #[tokio::test]
    async fn test_established_good_actor_gets_burst() {
        let (limiter, clock) = limiter(AdaptivePolicy::default());
        let browser = ClientSignals::new(Some("Mozilla/5.0"), Some("sess-1"));
        for i in 0..160u64 {
            let ok = i % 50 != 0;
            limiter
                .tracker()
                .record_outcome("good", ok, 80.0, browser)
                .await
                .unwrap();
            clock.advance(Duration::from_millis(700 + (i * 131) % 900));
        }
        let m = limiter.tracker().load("good").await.unwrap();
        assert_eq!(m.total_requests, 160);
        assert!(m.success_rate().unwrap() > 0.95);

        let limit = limiter.effective_limit("good", browser).await.unwrap();
        assert!(limit.max_requests > limiter.policy().max_requests);
    }

    #[tokio::test]
    async fn test_scores_are_persisted() {
        let (limiter, _) = limiter(AdaptivePolicy::default());
        limiter
            .effective_limit("id", ClientSignals::new(Some("curl/8.0"), None))
            .await
            .unwrap();
        let m = limiter.tracker().load("id").await.unwrap();
        assert_eq!(
            m.patterns,
            TrafficPatterns {
                is_bot: true,
                ..TrafficPatterns::default()
            }
        );
        // 50 + 5 - 20
        assert_eq!(m.trust_score, 35.0);
        assert_eq!(m.suspicion_score, 30.0);
    }

    #[tokio::test]
    async fn test_eleven_violations_ban_until_ttl_elapses() {
        let (limiter, clock) = limiter(AdaptivePolicy::default());
        for _ in 0..10 {
            assert!(!limiter.record_violation("x").await.unwrap().banned);
        }
        assert!(!limiter.is_banned("x").await.unwrap());

        let outcome = limiter.record_violation("x").await.unwrap();
        assert_eq!(outcome.violations, 11);
        assert!(outcome.banned);
        assert!(limiter.is_banned("x").await.unwrap());

        clock.advance(Duration::from_secs(3600));
        assert!(!limiter.is_banned("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_check_denies_over_quota_and_counts_violation() {
        let policy = AdaptivePolicy {
            max_requests: 3,
            window_ms: 60_000,
            ..AdaptivePolicy::default()
        };
        let (limiter, _) = limiter(policy);
        let signals = ClientSignals::default();

        for expected_remaining in [2, 1, 0] {
            match limiter.check("ip", signals).await.unwrap() {
                LimitDecision::Allowed { remaining, .. } => {
                    assert_eq!(remaining, expected_remaining)
                }
                other => panic!("expected allowed, got {other:?}"),
            }
        }

        match limiter.check("ip", signals).await.unwrap() {
            LimitDecision::Limited {
                limit, banned_now, ..
            } => {
                assert_eq!(limit.max_requests, 3);
                assert!(!banned_now);
            }
            other => panic!("expected limited, got {other:?}"),
        }
        assert_eq!(limiter.tracker().load("ip").await.unwrap().violations, 1);
    }

    #[tokio::test]
    async fn test_window_resets() {
        let policy = AdaptivePolicy {
            max_requests: 1,
            window_ms: 60_000,
            ..AdaptivePolicy::default()
        };
        let (limiter, clock) = limiter(policy);
        let signals = ClientSignals::default();

        assert!(matches!(
            limiter.check("ip", signals).await.unwrap(),
            LimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("ip", signals).await.unwrap(),
            LimitDecision::Limited { .. }
        ));
        clock.advance(Duration::from_secs(60));
        assert!(matches!(
            limiter.check("ip", signals).await.unwrap(),
            LimitDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_doubled_window_keeps_earlier_requests() {
        let policy = AdaptivePolicy {
            max_requests: 4,
            window_ms: 60_000,
            suspicion_threshold: 20.0,
            ..AdaptivePolicy::default()
        };
        let (limiter, clock) = limiter(policy);
        // start of a 120s-aligned window
        clock.set_ms(1_700_000_040_000);
        let browser = ClientSignals::new(Some("Mozilla/5.0"), Some("sess-1"));
        // bot signature: suspicion 30, quota 2 over 120s
        let bot = ClientSignals::new(Some("curl/8.0"), None);

        for _ in 0..2 {
            match limiter.check("ip", browser).await.unwrap() {
                LimitDecision::Allowed { limit, .. } => assert_eq!(limit.window_ms, 60_000),
                other => panic!("expected allowed, got {other:?}"),
            }
        }

        match limiter.check("ip", bot).await.unwrap() {
            LimitDecision::Limited {
                limit, retry_after, ..
            } => {
                assert_eq!(limit.window_ms, 120_000);
                assert_eq!(limit.max_requests, 2);
                assert_eq!(retry_after, Duration::from_secs(120));
            }
            other => panic!("expected limited, got {other:?}"),
        }

        // second half of the doubled window still sees the first bucket
        clock.advance(Duration::from_secs(61));
        assert!(matches!(
            limiter.check("ip", bot).await.unwrap(),
            LimitDecision::Limited { .. }
        ));

        clock.advance(Duration::from_secs(60));
        assert!(matches!(
            limiter.check("ip", bot).await.unwrap(),
            LimitDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_ban_short_circuits_check_and_can_be_lifted() {
        let policy = AdaptivePolicy {
            ban_threshold: 0,
            max_requests: 1,
            window_ms: 60_000,
            ..AdaptivePolicy::default()
        };
        let (limiter, _) = limiter(policy);
        let signals = ClientSignals::default();

        limiter.check("ip", signals).await.unwrap();
        let denied = limiter.check("ip", signals).await.unwrap();
        assert!(matches!(
            denied,
            LimitDecision::Limited {
                banned_now: true,
                ..
            }
        ));

        match limiter.check("ip", signals).await.unwrap() {
            LimitDecision::Banned { retry_after } => {
                assert!(retry_after <= Duration::from_secs(3600));
                assert!(retry_after > Duration::from_secs(3500));
            }
            other => panic!("expected banned, got {other:?}"),
        }

        assert!(limiter.lift_ban("ip").await.unwrap());
        assert!(!limiter.is_banned("ip").await.unwrap());
        assert_eq!(limiter.tracker().load("ip").await.unwrap().violations, 0);
    }
}
