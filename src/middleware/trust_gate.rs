//! Per-request admission control.
//!
//! # Flow
//!
//! ```text
//! request ─▶ resolve client IP ─▶ trusted? ──yes──▶ endpoint allowed? ──no──▶ 403
//!                                    │                   │
//!                                    no                 yes ─▶ custom quota left? ──no──▶ 429
//!                                    │                                 │
//!                                    ▼                                yes ─▶ inner service
//!                          AdaptiveLimiter::check
//!                           ├── Banned  ─▶ 429 temporarily_banned
//!                           ├── Limited ─▶ 429 + rate headers
//!                           └── Allowed ─▶ inner service + rate headers
//! ```
//!
//! Every decided request feeds the behavior history: denials (403 and 429)
//! count as failures, admitted requests by the inner status. Only requests
//! decided without the store (fail open or closed) go unrecorded.
//!
//! The client address comes from proxy headers only when the peer is one of
//! the configured [`TrustedProxies`]; the resolved value is attached to the
//! request as [`ClientIp`] for the auth layers behind the gate.
//!
//! Store failures during admission resolve through [`StoreFailurePolicy`]:
//! `open` passes the request through without rate headers, `closed` answers
//! 503.
//!
//! # Response Headers
//!
//! Adaptive decisions carry `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
//! `X-RateLimit-Reset` (seconds until the window rolls over). Denials add
//! `Retry-After`.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::Json;
use axum::body::Body;
use axum::http::header::{AsHeaderName, COOKIE, RETRY_AFTER, USER_AGENT};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::{ClientIp, TrustedProxies, resolve_client_ip};
use crate::config::StoreFailurePolicy;
use crate::error::{AppError, ErrorResponse, StoreResult};
use crate::metrics;
use crate::services::{
    AdaptiveLimiter, ClientSignals, EffectiveLimit, LimitDecision, TrustedIpRegistry,
    TrustedRateDecision,
};

/// Paths that never pass through the gate.
pub const GATE_BYPASS_PATHS: [&str; 2] = ["/health", "/ready"];

/// Explicit session header, checked before cookies.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Cookie names that carry a session id.
pub const SESSION_COOKIES: [&str; 2] = ["session_id", "sid"];

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// What the gate decided for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Trusted address within its allow-list and quota.
    Trusted,
    /// Trusted address outside its endpoint allow-list.
    EndpointForbidden,
    TrustedQuotaExceeded {
        limit: u32,
        retry_after: Duration,
    },
    Adaptive(LimitDecision),
}

impl GateDecision {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            GateDecision::Trusted => "trusted",
            GateDecision::EndpointForbidden => "endpoint_forbidden",
            GateDecision::TrustedQuotaExceeded { .. } => "trusted_quota_exceeded",
            GateDecision::Adaptive(LimitDecision::Allowed { .. }) => "allowed",
            GateDecision::Adaptive(LimitDecision::Limited { .. }) => "limited",
            GateDecision::Adaptive(LimitDecision::Banned { .. }) => "banned",
        }
    }
}

/// The trusted-IP registry and the adaptive limiter combined.
#[derive(Clone)]
pub struct TrustGate {
    registry: TrustedIpRegistry,
    limiter: AdaptiveLimiter,
    failure_policy: StoreFailurePolicy,
    proxies: Arc<TrustedProxies>,
}

impl TrustGate {
    /// Gate that believes proxy headers from loopback peers only.
    pub fn new(
        registry: TrustedIpRegistry,
        limiter: AdaptiveLimiter,
        failure_policy: StoreFailurePolicy,
    ) -> Self {
        Self {
            registry,
            limiter,
            failure_policy,
            proxies: Arc::new(TrustedProxies::loopback()),
        }
    }

    pub fn with_trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.proxies = Arc::new(proxies);
        self
    }

    pub fn failure_policy(&self) -> StoreFailurePolicy {
        self.failure_policy
    }

    /// Decide admission for `ip` requesting `endpoint`.
    pub async fn evaluate(
        &self,
        ip: &str,
        endpoint: &str,
        signals: ClientSignals<'_>,
    ) -> StoreResult<GateDecision> {
        let check = self.registry.is_trusted(ip).await?;
        match self.registry.rate_limit_for(&check, ip, endpoint).await? {
            TrustedRateDecision::NotTrusted => {}
            TrustedRateDecision::EndpointNotAllowed => return Ok(GateDecision::EndpointForbidden),
            TrustedRateDecision::Exceeded { limit, retry_after } => {
                return Ok(GateDecision::TrustedQuotaExceeded { limit, retry_after });
            }
            TrustedRateDecision::Allowed { .. } => {
                debug!(client_ip = %ip, reason = check.reason.as_str(), "Trusted request");
                return Ok(GateDecision::Trusted);
            }
        }
        Ok(GateDecision::Adaptive(self.limiter.check(ip, signals).await?))
    }

    /// Add one request to the behavior history of `ip`.
    async fn record_outcome(
        &self,
        ip: &str,
        success: bool,
        elapsed: Duration,
        signals: ClientSignals<'_>,
    ) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        if let Err(e) = self
            .limiter
            .tracker()
            .record_outcome(ip, success, elapsed_ms, signals)
            .await
        {
            warn!(client_ip = %ip, error = %e, "Failed to record request outcome");
        }
    }
}

/// Whole seconds, rounded up, never zero.
fn ceil_secs(d: Duration) -> u64 {
    let millis = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    millis.div_ceil(1000).max(1)
}

fn header_str(headers: &HeaderMap, name: impl AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Session id from `X-Session-Id`, else from a `session_id` / `sid` cookie.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(id) = header_str(headers, SESSION_ID_HEADER) {
        return Some(id);
    }
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| {
            SESSION_COOKIES.contains(&name.trim()) && !value.trim().is_empty()
        })
        .map(|(_, value)| value.trim().to_string())
}

fn rate_headers(
    limit: EffectiveLimit,
    remaining: u64,
    reset_after: Duration,
) -> [(HeaderName, HeaderValue); 3] {
    [
        (X_RATELIMIT_LIMIT, HeaderValue::from(limit.max_requests)),
        (X_RATELIMIT_REMAINING, HeaderValue::from(remaining)),
        (X_RATELIMIT_RESET, HeaderValue::from(ceil_secs(reset_after))),
    ]
}

fn forbidden_response() -> Response<Body> {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorResponse::new(
            "forbidden",
            "Endpoint not allowed for this trusted IP",
        )),
    )
        .into_response()
}

fn trusted_quota_response(limit: u32, retry_after: Duration) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (RETRY_AFTER, HeaderValue::from(ceil_secs(retry_after))),
            (X_RATELIMIT_LIMIT, HeaderValue::from(limit)),
            (X_RATELIMIT_REMAINING, HeaderValue::from(0u64)),
        ],
        Json(ErrorResponse::new(
            "too_many_requests",
            "Trusted IP rate limit exceeded. Please retry later.",
        )),
    )
        .into_response()
}

fn banned_response(retry_after: Duration) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(RETRY_AFTER, HeaderValue::from(ceil_secs(retry_after)))],
        Json(ErrorResponse::new(
            "temporarily_banned",
            "Too many rate limit violations. Please retry later.",
        )),
    )
        .into_response()
}

fn limited_response(limit: EffectiveLimit, retry_after: Duration) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(RETRY_AFTER, HeaderValue::from(ceil_secs(retry_after)))],
        rate_headers(limit, 0, retry_after),
        Json(ErrorResponse::new(
            "too_many_requests",
            "Rate limit exceeded. Please retry later.",
        )),
    )
        .into_response()
}

/// Response for a denied request, `None` when the request is admitted.
fn denial_response(
    decision: GateDecision,
    client_ip: &str,
    endpoint: &str,
) -> Option<Response<Body>> {
    match decision {
        GateDecision::Trusted | GateDecision::Adaptive(LimitDecision::Allowed { .. }) => None,
        GateDecision::EndpointForbidden => {
            warn!(
                client_ip = %client_ip,
                endpoint = %endpoint,
                "Trusted IP outside its endpoint allow-list"
            );
            Some(forbidden_response())
        }
        GateDecision::TrustedQuotaExceeded { limit, retry_after } => {
            warn!(client_ip = %client_ip, limit, "Trusted IP quota exceeded");
            Some(trusted_quota_response(limit, retry_after))
        }
        GateDecision::Adaptive(LimitDecision::Banned { retry_after }) => {
            debug!(client_ip = %client_ip, "Rejecting banned identifier");
            Some(banned_response(retry_after))
        }
        GateDecision::Adaptive(LimitDecision::Limited {
            limit,
            retry_after,
            banned_now,
        }) => {
            warn!(
                client_ip = %client_ip,
                max_requests = limit.max_requests,
                banned_now,
                "Rate limit exceeded"
            );
            Some(limited_response(limit, retry_after))
        }
    }
}

/// Tower layer running [`TrustGate`] in front of every route except
/// [`GATE_BYPASS_PATHS`].
#[derive(Clone)]
pub struct TrustGateLayer {
    gate: TrustGate,
}

impl TrustGateLayer {
    pub fn new(gate: TrustGate) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for TrustGateLayer {
    type Service = TrustGateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TrustGateService {
            inner,
            gate: self.gate.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TrustGateService<S> {
    inner: S,
    gate: TrustGate,
}

impl<S> Service<Request<Body>> for TrustGateService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if GATE_BYPASS_PATHS.contains(&req.uri().path()) {
                return inner.call(req).await;
            }

            let (client_ip, source) = resolve_client_ip(&req, &gate.proxies);
            let client_ip = client_ip.into_owned();
            req.extensions_mut().insert(ClientIp(client_ip.clone()));
            let endpoint = req.uri().path().to_string();
            let user_agent = header_str(req.headers(), USER_AGENT);
            let session_id = session_id_from_headers(req.headers());
            let signals = ClientSignals::new(user_agent.as_deref(), session_id.as_deref());

            let evaluated_at = Instant::now();
            let decision = match gate.evaluate(&client_ip, &endpoint, signals).await {
                Ok(decision) => decision,
                Err(e) => {
                    metrics::record_store_fallback(gate.failure_policy.as_str());
                    return match gate.failure_policy {
                        StoreFailurePolicy::Open => {
                            warn!(
                                client_ip = %client_ip,
                                error = %e,
                                "Store unavailable, failing open"
                            );
                            metrics::record_decision("store_fail_open");
                            inner.call(req).await
                        }
                        StoreFailurePolicy::Closed => {
                            warn!(
                                client_ip = %client_ip,
                                error = %e,
                                "Store unavailable, failing closed"
                            );
                            metrics::record_decision("store_fail_closed");
                            Ok(AppError::StoreUnavailable(e).into_response())
                        }
                    };
                }
            };
            metrics::record_decision(decision.label());
            debug!(
                client_ip = %client_ip,
                source = ?source,
                decision = decision.label(),
                "Gate decision"
            );

            if let Some(response) = denial_response(decision, &client_ip, &endpoint) {
                gate.record_outcome(&client_ip, false, evaluated_at.elapsed(), signals)
                    .await;
                return Ok(response);
            }

            let started = Instant::now();
            let mut response = inner.call(req).await?;
            let elapsed = started.elapsed();

            if let GateDecision::Adaptive(LimitDecision::Allowed {
                limit,
                remaining,
                reset_after,
            }) = decision
            {
                response
                    .headers_mut()
                    .extend(rate_headers(limit, remaining, reset_after));
            }

            let success = response.status().as_u16() < 400;
            gate.record_outcome(&client_ip, success, elapsed, signals)
                .await;

            Ok(response)
        })
    }
}
