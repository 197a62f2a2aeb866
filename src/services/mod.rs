//! Access-control services, built once at startup and shared through
//! [`crate::AppState`].
//!
//! ```text
//! TrustGateLayer
//!   ├── TrustedIpRegistry ─────────────┐
//!   └── AdaptiveLimiter                │
//!         ├── BehaviorTracker          ├── Arc<dyn RateLimitStore>
//!         ├── PatternAnalyzer          │
//!         └── trust_score::score (pure)│
//! BearerAuthLayer                      │
//!   └── SessionTokenService            │
//!         └── UserDirectory ───────────┘
//! ```

pub mod adaptive_limiter;
pub mod behavior;
pub mod patterns;
pub mod session_token;
pub mod trust_score;
pub mod trusted_ips;
pub mod users;

pub use adaptive_limiter::{AdaptiveLimiter, AdaptivePolicy, EffectiveLimit, LimitDecision};
pub use behavior::{BehaviorMetrics, BehaviorTracker};
pub use patterns::{PatternAnalyzer, SignatureClass, SignatureRule, TrafficPatterns};
pub use session_token::{JwtSecret, SessionClaims, SessionTokenService};
pub use trust_score::Scores;
pub use trusted_ips::{
    IpRange, TrustCheck, TrustReason, TrustedIpConfig, TrustedIpRegistry, TrustedRateDecision,
};
pub use users::{StoreUserDirectory, UserAuthRecord, UserDirectory};

/// Request attributes the behavioral services look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientSignals<'a> {
    pub user_agent: Option<&'a str>,
    pub session_id: Option<&'a str>,
}

impl<'a> ClientSignals<'a> {
    pub fn new(user_agent: Option<&'a str>, session_id: Option<&'a str>) -> Self {
        Self {
            user_agent,
            session_id,
        }
    }
}
