//! # trust_gate
//!
//! Request-trust and access-control layer for Axum services:
//!
//! - **Trusted IPs**: static list, IPv4 ranges and an admin-managed dynamic
//!   registry with expiry, endpoint allow-lists and per-minute quotas
//! - **Adaptive rate limiting**: per-client quotas that grow with trust and
//!   shrink with suspicion, plus violation-triggered temporary bans
//! - **Revocable sessions**: HS256 tokens checked against a per-user token
//!   version and password-change time
//! - **Shared state**: Redis (or in-process memory) behind a timeout and
//!   circuit breaker, with a configurable fail-open / fail-closed policy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Request ID → Trace → Trust Gate → Auth)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, admin, session)                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Services (registry, limiter, scoring, tokens, users)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  GuardedStore (timeout + circuit breaker)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RedisStore | MemoryStore                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trust_gate::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::connect(config).await?;
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! JWT_SECRET=... REDIS_URL=redis://127.0.0.1:6379 ADMIN_API_KEY=... cargo run
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, StoreFailurePolicy};
pub use error::{AppError, AppResult, StoreError, TokenError};
pub use routes::build_router;
pub use state::AppState;
pub use store::{MemoryStore, RateLimitStore, RedisStore};
