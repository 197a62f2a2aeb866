//! HTTP middleware.
//!
//! - **Trust gate**: trusted-IP registry plus behavior-adaptive rate limiting
//! - **Bearer auth**: revocable session tokens for `/auth` routes
//! - **API key auth**: constant-time admin key check for `/admin` routes
//! - **Request ID**: generation and propagation for tracing
//!
//! # Architecture
//!
//! ```text
//! Request → Request ID → Trace → Trust Gate → (Bearer | API Key) → Handler
//!                                    ↓                ↓
//!                           403 / 429 / 503       401 / 429
//! ```
//!
//! Both authentication layers share one [`AuthFailureThrottle`] so a client
//! cannot spread guesses across the two.

pub mod auth;
pub mod bearer;
pub mod ip;
pub mod request_id;
pub mod trust_gate;

pub use auth::{API_KEY_HEADER, ApiKeyAuth, AuthFailureThrottle};
pub use bearer::{BearerAuthLayer, parse_bearer};
pub use ip::{
    CLIENT_IP_HEADERS, ClientIp, TrustedProxies, UNKNOWN_IP, client_ip_of, extract_client_ip,
    resolve_client_ip,
};
pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer};
pub use trust_gate::{GateDecision, TrustGate, TrustGateLayer};
