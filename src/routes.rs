//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Adds X-Request-Id header
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Timeout      │ ← 408 past REQUEST_TIMEOUT_MS
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  CORS / Body     │ ← Cross-origin headers, body size limit
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Trust Gate     │ ← 403 / 429 / 503 (bypassed for /health, /ready)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Route guards    │ ← API key on /admin, bearer token on /auth
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Health & monitoring
//! - `/admin/...` - Trusted IPs, identifiers and session issuance (only with
//!   `ADMIN_API_KEY`)
//! - `/auth/...` - Session introspection and revocation

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::{self, admin};
use crate::middleware::{ApiKeyAuth, BearerAuthLayer, RequestIdLayer, TrustGateLayer};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// # Middleware Configuration
///
/// - **Admin routes**: mounted only if `admin_api_key` is set
/// - **CORS**: Configured from `cors_allowed_origins`
/// - **Timeout**: `request_timeout` bounds the whole request, store round
///   trips included
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    let auth_routes = Router::new()
        .route("/session", get(handlers::current_session))
        .route("/logout-all", post(handlers::logout_all))
        .route_layer(BearerAuthLayer::new(
            state.tokens.clone(),
            state.auth_throttle.clone(),
        ));

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .nest("/auth", auth_routes);

    match &config.admin_api_key {
        Some(key) => {
            info!("Admin API enabled");
            let admin_routes = Router::new()
                .route(
                    "/trusted-ips",
                    get(admin::list_trusted_ips).post(admin::add_trusted_ip),
                )
                .route(
                    "/trusted-ips/{ip}",
                    get(admin::check_trusted_ip).delete(admin::remove_trusted_ip),
                )
                .route("/identifiers/{id}", get(admin::get_identifier))
                .route("/identifiers/{id}/ban", delete(admin::lift_ban))
                .route("/sessions", post(admin::issue_session))
                .route("/users/{id}/password-changed", post(admin::password_changed))
                .route_layer(ApiKeyAuth::new(key.clone(), state.auth_throttle.clone()));
            router = router.nest("/admin", admin_routes);
        }
        None => warn!("Admin API disabled (no ADMIN_API_KEY set)"),
    }

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Trust gate, innermost of the global layers so rejected requests are
    //    still traced and carry a request ID
    router = router.layer(TrustGateLayer::new(state.trust_gate()));

    // 2. Request body size limit
    info!(
        max_size_bytes = config.max_request_body_size,
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 3. CORS
    router = router.layer(build_cors_layer(&config.cors_allowed_origins));

    // 4. Outer deadline
    #[allow(deprecated)]
    let timeout = TimeoutLayer::new(config.request_timeout);
    router = router.layer(timeout);

    // 5. Tracing
    router = router.layer(TraceLayer::new_for_http());

    // 6. Request ID
    router = router.layer(RequestIdLayer::new());

    router.with_state(state)
}

/// Build CORS layer from configuration.
///
/// # Arguments
///
/// * `allowed_origins` - List of allowed origins, or `["*"]` for any origin
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(origin) => Some(origin),
                Err(_) => {
                    warn!(origin = %o, "Skipping malformed CORS origin");
                    None
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
