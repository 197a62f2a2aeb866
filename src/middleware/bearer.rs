//! Bearer session-token authentication.
//!
//! Parses `Authorization: Bearer <token>`, verifies the token through
//! [`SessionTokenService::verify`] and stores the resulting
//! [`SessionClaims`] in the request extensions for handlers to extract with
//! `Extension<SessionClaims>`.
//!
//! | Failure | Status | Message |
//! |---|---|---|
//! | no `Authorization` header | 401 | `Authorization header required` |
//! | not the `Bearer` scheme | 401 | `Authorization header must use the Bearer scheme` |
//! | `Bearer ` with nothing after it | 401 | `Bearer token is empty` |
//! | any token failure | 401 | `Invalid or expired token` |
//! | user directory unreachable | 503 | `store_unavailable` |
//!
//! Token failures share one message whatever the cause. Format and token
//! failures count against the client IP in the [`AuthFailureThrottle`].

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::auth::{AuthFailureThrottle, throttled_response, unauthorized_response};
use super::ip::client_ip_of;
use crate::error::{AppError, BearerError, TokenError};
use crate::services::{SessionClaims, SessionTokenService};

const BEARER_PREFIX: &str = "Bearer ";

/// Client-facing message for every token verification failure.
pub const INVALID_TOKEN_MESSAGE: &str = "Invalid or expired token";

/// Extract the token from an `Authorization` header value.
pub fn parse_bearer(header: Option<&str>) -> Result<&str, BearerError> {
    let value = header.ok_or(BearerError::Missing)?.trim();
    if value == BEARER_PREFIX.trim_end() {
        return Err(BearerError::EmptyToken);
    }
    let token = value
        .strip_prefix(BEARER_PREFIX)
        .ok_or(BearerError::InvalidScheme)?
        .trim();
    if token.is_empty() {
        return Err(BearerError::EmptyToken);
    }
    Ok(token)
}

fn bearer_error_message(e: BearerError) -> &'static str {
    match e {
        BearerError::Missing => "Authorization header required",
        BearerError::InvalidScheme => "Authorization header must use the Bearer scheme",
        BearerError::EmptyToken => "Bearer token is empty",
    }
}

#[derive(Clone)]
pub struct BearerAuthLayer {
    tokens: SessionTokenService,
    throttle: AuthFailureThrottle,
}

impl BearerAuthLayer {
    pub fn new(tokens: SessionTokenService, throttle: AuthFailureThrottle) -> Self {
        Self { tokens, throttle }
    }
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuthService {
            inner,
            tokens: self.tokens.clone(),
            throttle: self.throttle.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BearerAuthService<S> {
    inner: S,
    tokens: SessionTokenService,
    throttle: AuthFailureThrottle,
}

impl<S> Service<Request<Body>> for BearerAuthService<S>
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
        let tokens = self.tokens.clone();
        let throttle = self.throttle.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let client_ip = client_ip_of(&req).into_owned();

            if let Some(wait) = throttle.blocked_for(&client_ip) {
                return Ok(throttled_response(wait));
            }

            let header = req
                .headers()
                .get(AUTHORIZATION)
                .map(|v| v.to_str().unwrap_or_default());
            let token = match parse_bearer(header) {
                Ok(token) => token.to_string(),
                Err(e) => {
                    if e.is_format_error() {
                        throttle.record_failure(&client_ip);
                    }
                    debug!(client_ip = %client_ip, error = %e, "Rejected authorization header");
                    return Ok(unauthorized_response("Bearer", bearer_error_message(e)));
                }
            };

            let claims: SessionClaims = match tokens.verify(&token).await {
                Ok(claims) => claims,
                Err(TokenError::Directory(e)) => {
                    warn!(client_ip = %client_ip, error = %e, "User directory unavailable");
                    return Ok(AppError::StoreUnavailable(e).into_response());
                }
                Err(e) => {
                    throttle.record_failure(&client_ip);
                    warn!(
                        client_ip = %client_ip,
                        reason = e.kind(),
                        "Session token rejected"
                    );
                    return Ok(unauthorized_response("Bearer", INVALID_TOKEN_MESSAGE));
                }
            };

            debug!(user_id = %claims.user_id, "Session token accepted");
            req.extensions_mut().insert(claims);
            inner.call(req).await
        })
    }
}
