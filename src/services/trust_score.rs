//! Trust and suspicion scoring.
//!
//! Pure functions of a [`BehaviorMetrics`] snapshot. Both scores are clamped
//! to `[0, 100]` after all adjustments.

use serde::Serialize;

use super::behavior::{BehaviorMetrics, INITIAL_TRUST};

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Scores {
    pub trust: f64,
    pub suspicion: f64,
}

fn clamp(score: f64) -> f64 {
    if score.is_nan() {
        return SCORE_MIN;
    }
    score.clamp(SCORE_MIN, SCORE_MAX)
}

/// Score `metrics` as of `now_ms`. `metrics.patterns` must already describe
/// the current request.
pub fn score(metrics: &BehaviorMetrics, now_ms: u64) -> Scores {
    Scores {
        trust: trust(metrics),
        suspicion: suspicion(metrics, now_ms),
    }
}

pub fn trust(m: &BehaviorMetrics) -> f64 {
    let p = &m.patterns;
    let mut trust = INITIAL_TRUST;

    if let Some(rate) = m.success_rate() {
        trust += rate * 20.0;
    }
    if p.has_valid_session {
        trust += 10.0;
    }
    if m.avg_response_time_ms < 1000.0 {
        trust += 5.0;
    }
    if p.is_bot && !p.is_crawler {
        trust -= 20.0;
    }
    trust -= 5.0 * m.violations as f64;
    if m.failed_requests > m.successful_requests {
        trust -= 15.0;
    }

    clamp(trust)
}

pub fn suspicion(m: &BehaviorMetrics, now_ms: u64) -> f64 {
    let p = &m.patterns;
    let mut suspicion = 0.0;

    if p.is_bot && !p.is_crawler && !p.is_api_client {
        suspicion += 30.0;
    }
    if m.violations > 5 {
        suspicion += 2.0 * (m.violations - 5) as f64;
    }
    if m.success_rate().is_some_and(|rate| 1.0 - rate > 0.5) {
        suspicion += 20.0;
    }
    if let Some(last) = m.last_request_time
        && now_ms.saturating_sub(last) < 100
        && m.total_requests > 10
    {
        suspicion += 15.0;
    }
    if !p.has_valid_session && m.total_requests > 50 {
        suspicion += 10.0;
    }

    clamp(suspicion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::TrafficPatterns;

    const NOW: u64 = 1_700_000_000_000;

    fn metrics(total: u64, ok: u64) -> BehaviorMetrics {
        BehaviorMetrics {
            total_requests: total,
            successful_requests: ok,
            failed_requests: total - ok,
            avg_response_time_ms: 120.0,
            last_request_time: Some(NOW - 5_000),
            ..BehaviorMetrics::default()
        }
    }

    #[test]
    fn test_fresh_identifier() {
        let s = score(&BehaviorMetrics::default(), NOW);
        // base plus the latency bonus of an empty average
        assert_eq!(s.trust, 55.0);
        assert_eq!(s.suspicion, 0.0);
    }

    #[test]
    fn test_well_behaved_session_user() {
        let mut m = metrics(40, 40);
        m.patterns.has_valid_session = true;
        // 50 + 20 + 10 + 5
        assert_eq!(trust(&m), 85.0);
        assert_eq!(suspicion(&m, NOW), 0.0);
    }

    #[test]
    fn test_failing_bot() {
        let mut m = metrics(60, 10);
        m.patterns = TrafficPatterns {
            is_bot: true,
            ..TrafficPatterns::default()
        };
        m.violations = 8;
        m.last_request_time = Some(NOW - 20);
        // 50 + 20/6 + 5 - 20 - 40 - 15, clamped
        assert_eq!(trust(&m), 0.0);
        // 30 + 6 + 20 + 15 + 10
        assert_eq!(suspicion(&m, NOW), 81.0);
    }

    #[test]
    fn test_api_client_is_not_suspicious_for_being_a_bot() {
        let mut m = metrics(5, 5);
        m.patterns = TrafficPatterns {
            is_bot: true,
            is_api_client: true,
            ..TrafficPatterns::default()
        };
        assert_eq!(suspicion(&m, NOW), 0.0);
        // still loses the bot trust bonus
        assert_eq!(trust(&m), 55.0);
    }

    #[test]
    fn test_scores_clamp_at_the_top() {
        let mut m = metrics(100, 0);
        m.patterns.is_bot = true;
        m.violations = 1_000;
        m.last_request_time = Some(NOW);
        let s = score(&m, NOW);
        assert_eq!(s.trust, SCORE_MIN);
        assert_eq!(s.suspicion, SCORE_MAX);
    }

    #[test]
    fn test_slow_responses_lose_latency_bonus() {
        let mut m = metrics(10, 10);
        m.avg_response_time_ms = 2_500.0;
        assert_eq!(trust(&m), 70.0);
    }
}
