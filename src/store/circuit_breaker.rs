//! Circuit breaker that short-circuits store calls while the backend is down.
//!
//! ```text
//!            consecutive failures >= failure_threshold
//!   Closed ─────────────────────────────────────────────► Open
//!     ▲                                                    │
//!     │ success_threshold trials succeed                   │ open_duration elapses
//!     │                                                    ▼
//!     └──────────────────────────────────────────────── HalfOpen
//!                     any trial failure: back to Open ◄────┘
//! ```
//!
//! While open, [`GuardedStore`](super::GuardedStore) fails each call with
//! `StoreError::CircuitOpen` without touching the backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 = closed, 1 = half-open, 2 = open.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed round trips that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successful trial calls that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    failures: u32,
    trial_successes: u32,
}

impl Inner {
    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_successes = 0;
    }
}

/// Shared breaker guarding one store backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    opened_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                failures: 0,
                trial_successes: 0,
            }),
            opened_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Whether a store call may be attempted now.
    ///
    /// An open circuit whose `open_duration` has elapsed moves to half-open
    /// and lets the call through as a trial.
    pub async fn allow(&self) -> bool {
        {
            let inner = self.inner.read().await;
            if inner.state != CircuitState::Open {
                return true;
            }
            if inner
                .opened_at
                .is_some_and(|t| t.elapsed() < self.config.open_duration)
            {
                self.reject();
                return false;
            }
        }

        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Open
                if inner
                    .opened_at
                    .is_none_or(|t| t.elapsed() >= self.config.open_duration) =>
            {
                inner.state = CircuitState::HalfOpen;
                inner.trial_successes = 0;
                metrics::set_store_circuit_state(CircuitState::HalfOpen);
                info!("Store circuit half-open, probing backend");
                true
            }
            CircuitState::Open => {
                self.reject();
                false
            }
            CircuitState::Closed | CircuitState::HalfOpen => true,
        }
    }

    pub async fn on_success(&self) {
        {
            let inner = self.inner.read().await;
            if inner.state == CircuitState::Closed && inner.failures == 0 {
                return;
            }
        }

        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.trial_successes += 1;
                debug!(
                    trial_successes = inner.trial_successes,
                    needed = self.config.success_threshold,
                    "Store trial call succeeded"
                );
                if inner.trial_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.failures = 0;
                    metrics::set_store_circuit_state(CircuitState::Closed);
                    info!("Store circuit closed, backend recovered");
                }
            }
            // A call admitted just before another task tripped the circuit.
            CircuitState::Open => {}
        }
    }

    pub async fn on_failure(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.trip();
                    self.opened();
                    warn!(
                        failures = inner.failures,
                        open_for = ?self.config.open_duration,
                        "Store circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.trip();
                self.opened();
                warn!("Store trial call failed, circuit reopened");
            }
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    fn opened(&self) {
        self.opened_total.fetch_add(1, Ordering::Relaxed);
        metrics::record_store_circuit_opened();
        metrics::set_store_circuit_state(CircuitState::Open);
    }

    fn reject(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
        metrics::record_store_circuit_rejection();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
