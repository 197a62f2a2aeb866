//! Admin API key authentication and the shared auth-failure throttle.
//!
//! # Security Features
//!
//! - **Constant-time comparison**: the `X-API-Key` header is compared with
//!   `subtle`, so response timing reveals nothing about the key
//! - **Header only**: keys in query strings end up in logs and are not
//!   accepted
//! - **Brute force protection**: failures are counted per client IP with a
//!   `governor` keyed limiter. Once an IP exhausts its failure quota it is
//!   answered 429 until the quota refills, before any credential is looked at
//!
//! # Usage
//!
//! ```bash
//! ADMIN_API_KEY=your-admin-key cargo run
//! curl -H "X-API-Key: your-admin-key" http://localhost:3000/admin/trusted-ips
//! ```
//!
//! Without `ADMIN_API_KEY` the `/admin` routes are not mounted at all.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::Json;
use axum::body::Body;
use axum::http::header::{RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::client_ip_of;
use crate::error::ErrorResponse;

/// Header carrying the admin API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Sustained auth failures tolerated per IP per minute.
const AUTH_FAILURES_PER_MINUTE: NonZeroU32 = match NonZeroU32::new(10) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

/// Failures an IP may burn through at once.
const AUTH_FAILURE_BURST: NonZeroU32 = match NonZeroU32::new(5) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Per-IP authentication failure throttle, shared by the admin key layer and
/// the bearer layer.
///
/// Only failures consume quota. When a failure finds the quota empty, the IP
/// is blocked until governor would admit it again.
#[derive(Clone)]
pub struct AuthFailureThrottle {
    limiter: Arc<AuthFailureLimiter>,
    blocked_until: Arc<DashMap<String, Instant>>,
}

impl Default for AuthFailureThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthFailureThrottle {
    pub fn new() -> Self {
        Self::with_quota(
            Quota::per_minute(AUTH_FAILURES_PER_MINUTE).allow_burst(AUTH_FAILURE_BURST),
        )
    }

    pub fn with_quota(quota: Quota) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            blocked_until: Arc::new(DashMap::new()),
        }
    }

    /// Remaining block time for `ip`, if any.
    pub fn blocked_for(&self, ip: &str) -> Option<Duration> {
        let now = Instant::now();
        let until = *self.blocked_until.get(ip)?;
        if until > now {
            return Some(until - now);
        }
        self.blocked_until.remove_if(ip, |_, until| *until <= now);
        None
    }

    /// Count one failure for `ip`.
    pub fn record_failure(&self, ip: &str) {
        if let Err(not_until) = self.limiter.check_key(&ip.to_string()) {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            error!(
                client_ip = %ip,
                retry_after_secs = wait.as_secs().max(1),
                "IP blocked due to excessive auth failures"
            );
            self.blocked_until.insert(ip.to_string(), Instant::now() + wait);
        }
    }
}

/// Perform constant-time comparison of two strings.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// 401 with a JSON body and a challenge naming `scheme`.
pub(crate) fn unauthorized_response(scheme: &'static str, message: &str) -> Response<Body> {
    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, HeaderValue::from_static(scheme))],
        Json(ErrorResponse::new("unauthorized", message)),
    )
        .into_response()
}

/// 429 for an IP blocked by the [`AuthFailureThrottle`].
pub(crate) fn throttled_response(retry_after: Duration) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)))],
        Json(ErrorResponse::new(
            "too_many_requests",
            "Too many failed authentication attempts. Please wait before retrying.",
        )),
    )
        .into_response()
}

/// Admin API key layer.
#[derive(Clone)]
pub struct ApiKeyAuth {
    expected_key: Arc<String>,
    throttle: AuthFailureThrottle,
}

impl ApiKeyAuth {
    pub fn new(api_key: String, throttle: AuthFailureThrottle) -> Self {
        Self {
            expected_key: Arc::new(api_key),
            throttle,
        }
    }
}

impl<S> Layer<S> for ApiKeyAuth {
    type Service = ApiKeyAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApiKeyAuthService {
            inner,
            expected_key: self.expected_key.clone(),
            throttle: self.throttle.clone(),
        }
    }
}

/// API key authentication service wrapper.
#[derive(Clone)]
pub struct ApiKeyAuthService<S> {
    inner: S,
    expected_key: Arc<String>,
    throttle: AuthFailureThrottle,
}

impl<S> Service<Request<Body>> for ApiKeyAuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let expected = self.expected_key.clone();
        let throttle = self.throttle.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let client_ip = client_ip_of(&req).into_owned();

            if let Some(wait) = throttle.blocked_for(&client_ip) {
                return Ok(throttled_response(wait));
            }

            let matched = extract_api_key(&req).map(|key| constant_time_eq(key, &expected));
            match matched {
                Some(true) => {
                    debug!(client_ip = %client_ip, "Admin API key accepted");
                    inner.call(req).await
                }
                Some(false) => {
                    throttle.record_failure(&client_ip);
                    warn!(
                        path = %req.uri().path(),
                        client_ip = %client_ip,
                        "Invalid API key provided"
                    );
                    Ok(unauthorized_response("API-Key", "Invalid API key"))
                }
                None => {
                    throttle.record_failure(&client_ip);
                    warn!(
                        path = %req.uri().path(),
                        client_ip = %client_ip,
                        "Missing API key"
                    );
                    Ok(unauthorized_response("API-Key", "API key required"))
                }
            }
        })
    }
}

fn extract_api_key<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
}
