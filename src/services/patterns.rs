//! Traffic classification from the user agent, session and request timing.
//!
//! User-agent signatures are a rule table: each [`SignatureRule`] maps a
//! case-insensitive regex to one [`SignatureClass`]. New signatures are added
//! as rows, not branches.

use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ClientSignals;
use super::behavior::BehaviorTracker;
use crate::error::StoreResult;

/// Timestamps pulled for timing analysis.
pub const TIMING_SAMPLE_SIZE: usize = 20;

/// Fewer samples than this are not judged.
pub const TIMING_MIN_SAMPLES: usize = 10;

/// Interval variance (ms²) below which traffic counts as machine-paced.
pub const TIMING_VARIANCE_THRESHOLD: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureClass {
    Bot,
    Crawler,
    ApiClient,
}

#[derive(Debug, Clone)]
pub struct SignatureRule {
    pub pattern: Regex,
    pub class: SignatureClass,
}

impl SignatureRule {
    /// Compile a case-insensitive rule.
    pub fn new(pattern: &str, class: SignatureClass) -> Result<Self, regex::Error> {
        let pattern = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self { pattern, class })
    }
}

const DEFAULT_SIGNATURES: &[(&str, SignatureClass)] = &[
    (r"bot\b|bot/", SignatureClass::Bot),
    (r"crawl", SignatureClass::Bot),
    (r"spider", SignatureClass::Bot),
    (r"scrap(er|y|ing)", SignatureClass::Bot),
    (r"^curl/", SignatureClass::Bot),
    (r"^wget/", SignatureClass::Bot),
    (r"python-(requests|urllib)", SignatureClass::Bot),
    (r"go-http-client", SignatureClass::Bot),
    (r"headless", SignatureClass::Bot),
    (r"phantomjs", SignatureClass::Bot),
    (r"selenium", SignatureClass::Bot),
    (r"googlebot", SignatureClass::Crawler),
    (r"bingbot", SignatureClass::Crawler),
    (r"yahoo! slurp", SignatureClass::Crawler),
    (r"duckduckbot", SignatureClass::Crawler),
    (r"baiduspider", SignatureClass::Crawler),
    (r"yandexbot", SignatureClass::Crawler),
    (r"applebot", SignatureClass::Crawler),
    (r"postmanruntime", SignatureClass::ApiClient),
    (r"insomnia", SignatureClass::ApiClient),
    (r"axios/", SignatureClass::ApiClient),
    (r"okhttp", SignatureClass::ApiClient),
    (r"httpie", SignatureClass::ApiClient),
    (r"node-fetch", SignatureClass::ApiClient),
];

/// Built-in rule table. Rows that fail to compile are logged and dropped.
pub fn default_rules() -> Vec<SignatureRule> {
    DEFAULT_SIGNATURES
        .iter()
        .filter_map(|(pattern, class)| match SignatureRule::new(pattern, *class) {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!(pattern, error = %e, "Skipping invalid signature rule");
                None
            }
        })
        .collect()
}

/// Classification flags for one identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficPatterns {
    pub is_bot: bool,
    pub is_crawler: bool,
    pub is_api_client: bool,
    pub has_valid_session: bool,
}

/// Population variance of the gaps between consecutive timestamps.
/// `None` when fewer than two gaps exist.
pub fn interval_variance(timestamps: &[f64]) -> Option<f64> {
    let intervals: Vec<f64> = timestamps
        .iter()
        .zip(timestamps.iter().skip(1))
        .map(|(earlier, later)| later - earlier)
        .collect();
    if intervals.len() < 2 {
        return None;
    }
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    Some(intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n)
}

#[derive(Clone)]
pub struct PatternAnalyzer {
    rules: Arc<[SignatureRule]>,
    tracker: BehaviorTracker,
}

impl PatternAnalyzer {
    pub fn new(tracker: BehaviorTracker) -> Self {
        Self::with_rules(tracker, default_rules())
    }

    pub fn with_rules(tracker: BehaviorTracker, rules: Vec<SignatureRule>) -> Self {
        Self {
            rules: rules.into(),
            tracker,
        }
    }

    /// Classify a user agent against the rule table. Crawler matches clear
    /// the bot flag.
    pub fn classify_user_agent(&self, user_agent: &str) -> TrafficPatterns {
        let mut patterns = TrafficPatterns::default();
        for rule in self.rules.iter().filter(|r| r.pattern.is_match(user_agent)) {
            match rule.class {
                SignatureClass::Bot => patterns.is_bot = true,
                SignatureClass::Crawler => patterns.is_crawler = true,
                SignatureClass::ApiClient => patterns.is_api_client = true,
            }
        }
        if patterns.is_crawler {
            patterns.is_bot = false;
        }
        patterns
    }

    /// Classify the current request of `identifier`.
    pub async fn analyze(
        &self,
        identifier: &str,
        signals: ClientSignals<'_>,
    ) -> StoreResult<TrafficPatterns> {
        let mut patterns = signals
            .user_agent
            .map(|ua| self.classify_user_agent(ua))
            .unwrap_or_default();
        patterns.has_valid_session = signals.session_id.is_some_and(|s| !s.is_empty());

        if !patterns.is_crawler && !patterns.is_bot {
            let times = self
                .tracker
                .recent_request_times(identifier, TIMING_SAMPLE_SIZE)
                .await?;
            if times.len() >= TIMING_MIN_SAMPLES
                && let Some(variance) = interval_variance(&times)
                && variance < TIMING_VARIANCE_THRESHOLD
            {
                debug!(identifier, variance, "Machine-paced request timing");
                patterns.is_bot = true;
            }
        }

        Ok(patterns)
    }
}
