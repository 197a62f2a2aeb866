//! Shared application state for Axum handlers and middleware.
//!
//! The whole service graph is built here once, explicitly, from a
//! [`Config`] and a store strategy. Nothing is global: tests build as many
//! independent graphs as they like, each with its own store and clock.
//!
//! ```text
//! Config ──► AppState::connect
//!              ├── RedisStore | MemoryStore
//!              │     └── GuardedStore (timeout + circuit breaker)
//!              ├── TrustedIpRegistry
//!              ├── AdaptiveLimiter (BehaviorTracker, PatternAnalyzer)
//!              ├── SessionTokenService (StoreUserDirectory)
//!              └── AuthFailureThrottle
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{AppError, AppResult, StoreError};
use crate::middleware::{AuthFailureThrottle, TrustGate};
use crate::services::{
    AdaptiveLimiter, BehaviorTracker, PatternAnalyzer, SessionTokenService, StoreUserDirectory,
    TrustedIpRegistry, UserDirectory,
};
use crate::store::{CircuitState, GuardedStore, MemoryStore, RateLimitStore, RedisStore};

/// Shared application state.
///
/// Cloned for each request; every component is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Guarded store every service talks to
    pub store: Arc<dyn RateLimitStore>,
    guarded: Arc<GuardedStore>,
    pub registry: TrustedIpRegistry,
    pub limiter: AdaptiveLimiter,
    pub tokens: SessionTokenService,
    /// Shared by the admin and bearer layers
    pub auth_throttle: AuthFailureThrottle,
    pub started_at: Instant,
}

impl AppState {
    /// Connect the configured store and build the service graph.
    ///
    /// `REDIS_URL` selects the Redis strategy; otherwise the in-process
    /// memory store is used.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` when Redis cannot be reached and
    /// `AppError::ConfigError` when the JWT secret is missing.
    pub async fn connect(config: Config) -> AppResult<Self> {
        let backend: Arc<dyn RateLimitStore> = match &config.redis_url {
            Some(url) => {
                info!("Connecting to Redis rate-limit store");
                Arc::new(RedisStore::connect(url).await?)
            }
            None => {
                warn!("REDIS_URL not set, using in-process memory store (single instance only)");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(config, backend, Arc::new(SystemClock))
    }

    /// Build the service graph over an already constructed store strategy.
    ///
    /// The store is wrapped in a [`GuardedStore`] using the configured
    /// timeout and circuit breaker settings.
    pub fn with_store(
        config: Config,
        backend: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        let secret = config
            .jwt_secret
            .clone()
            .ok_or_else(|| AppError::ConfigError("JWT_SECRET is required".to_string()))?;

        let guarded = Arc::new(GuardedStore::new(
            backend,
            config.store_timeout,
            config.circuit_breaker(),
        ));
        let store: Arc<dyn RateLimitStore> = guarded.clone();

        let registry = TrustedIpRegistry::new(
            &config.trusted_ips,
            config.trusted_ip_ranges.clone(),
            store.clone(),
            clock.clone(),
        );

        let tracker = BehaviorTracker::new(store.clone(), clock.clone());
        let analyzer = PatternAnalyzer::new(tracker.clone());
        let limiter = AdaptiveLimiter::new(
            store.clone(),
            clock,
            tracker,
            analyzer,
            config.adaptive.clone(),
        );

        let directory: Arc<dyn UserDirectory> = Arc::new(StoreUserDirectory::new(store.clone()));
        let tokens = SessionTokenService::from_secret(&secret, config.jwt_expires_in, directory);

        info!(
            backend = store.backend(),
            failure_policy = %config.store_failure_policy,
            admin_enabled = config.admin_enabled(),
            "Service graph initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            guarded,
            registry,
            limiter,
            tokens,
            auth_throttle: AuthFailureThrottle::new(),
            started_at: Instant::now(),
        })
    }

    /// The admission gate run in front of every non-health route.
    pub fn trust_gate(&self) -> TrustGate {
        TrustGate::new(
            self.registry.clone(),
            self.limiter.clone(),
            self.config.store_failure_policy,
        )
        .with_trusted_proxies(self.config.trusted_proxies.clone())
    }

    pub async fn store_circuit(&self) -> CircuitState {
        self.guarded.breaker().state().await
    }

    /// Round-trip the store through the guard.
    pub async fn ping_store(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
