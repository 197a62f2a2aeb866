//! End-to-end HTTP tests against a real listener on an ephemeral port.
//!
//! Each test builds its own service graph over the in-process memory store
//! with a manual clock, so no external services are required.
//!
//! Run with: `cargo test --test api_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use trust_gate::services::{AdaptivePolicy, JwtSecret};
use trust_gate::{AppState, Config, ManualClock, MemoryStore, build_router};

const SECRET: &str = "k9Vx2LqP7mZ4rT8wY1nB6cD3fG5hJ0sA";
const ADMIN_KEY: &str = "operator-key-7f3a9c21d4";
const BROWSER_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Test fixture owning a running server and its state.
struct TestFixture {
    base_url: String,
    client: Client,
    state: AppState,
    _clock: ManualClock,
}

impl TestFixture {
    async fn new(policy: AdaptivePolicy) -> Self {
        let clock = ManualClock::default();
        let config = Config {
            jwt_secret: Some(JwtSecret::new(SECRET).unwrap()),
            admin_api_key: Some(ADMIN_KEY.to_string()),
            adaptive: policy,
            ..Config::default()
        };
        let state = AppState::with_store(
            config,
            Arc::new(MemoryStore::with_clock(Arc::new(clock.clone()))),
            Arc::new(clock.clone()),
        )
        .expect("Failed to build service graph");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to ephemeral port");
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("Server failed");
        });

        let client = Client::builder().user_agent(BROWSER_UA).build().unwrap();

        Self {
            base_url: format!("http://{addr}"),
            client,
            state,
            _clock: clock,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET as a proxied client at `ip`.
    async fn get_as(&self, ip: &str, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("x-forwarded-for", ip)
            .send()
            .await
            .expect("Request failed")
    }

    fn admin(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("x-api-key", ADMIN_KEY)
    }
}

fn strict_policy(max_requests: u64) -> AdaptivePolicy {
    AdaptivePolicy {
        max_requests,
        trust_bonus_multiplier: 1.0,
        suspicion_penalty_divisor: 1.0,
        ..AdaptivePolicy::default()
    }
}

#[tokio::test]
async fn test_health_reports_memory_store() {
    let fixture = TestFixture::new(AdaptivePolicy::default()).await;

    let response = fixture.client.get(fixture.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store_backend"], "memory");
    assert_eq!(body["store_reachable"], true);
    assert_eq!(body["store_circuit"], "closed");
    assert_eq!(body["store_failure_policy"], "open");

    let ready = fixture.client.get(fixture.url("/ready")).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_adaptive_limit_headers_and_429() {
    let fixture = TestFixture::new(strict_policy(3)).await;
    let ip = "198.51.100.20";

    for expected_remaining in ["2", "1", "0"] {
        let response = fixture.get_as(ip, "/api/orders").await;
        // no such route, but the gate still admitted it
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-ratelimit-limit"], "3");
        assert_eq!(
            response.headers()["x-ratelimit-remaining"],
            expected_remaining
        );
    }

    let limited = fixture.get_as(ip, "/api/orders").await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key("retry-after"));
    assert_eq!(limited.headers()["x-ratelimit-remaining"], "0");
    let body: Value = limited.json().await.unwrap();
    assert_eq!(body["error"], "too_many_requests");

    // another client is unaffected
    let other = fixture.get_as("198.51.100.21", "/api/orders").await;
    assert_eq!(other.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_violations_ban_and_operator_lifts_it() {
    let fixture = TestFixture::new(AdaptivePolicy {
        ban_threshold: 1,
        ..strict_policy(1)
    })
    .await;
    let ip = "203.0.113.50";

    assert_eq!(fixture.get_as(ip, "/api").await.status(), StatusCode::NOT_FOUND);
    // first violation
    assert_eq!(
        fixture.get_as(ip, "/api").await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    // second violation crosses the threshold
    assert_eq!(
        fixture.get_as(ip, "/api").await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let banned = fixture.get_as(ip, "/api").await;
    assert_eq!(banned.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(banned.headers()["retry-after"], "3600");
    let body: Value = banned.json().await.unwrap();
    assert_eq!(body["error"], "temporarily_banned");

    // admin calls come from loopback, which is always trusted
    let snapshot: Value = fixture
        .admin(fixture.client.get(fixture.url(&format!("/admin/identifiers/{ip}"))))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["banned"], true);
    assert_eq!(snapshot["metrics"]["violations"], 2);

    let lifted: Value = fixture
        .admin(
            fixture
                .client
                .delete(fixture.url(&format!("/admin/identifiers/{ip}/ban"))),
        )
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(lifted["banLifted"], true);

    let after = fixture.state.limiter.ban_remaining(ip).await.unwrap();
    assert!(after.is_none());
}

#[tokio::test]
async fn test_admin_requires_api_key() {
    let fixture = TestFixture::new(AdaptivePolicy::default()).await;

    let response = fixture
        .client
        .get(fixture.url("/admin/trusted-ips"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = fixture
        .client
        .get(fixture.url("/admin/trusted-ips"))
        .header("x-api-key", "wrong-key")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_dynamic_trusted_ip_lifecycle() {
    let fixture = TestFixture::new(strict_policy(1)).await;
    let ip = "192.0.2.44";

    let created = fixture
        .admin(fixture.client.post(fixture.url("/admin/trusted-ips")))
        .json(&json!({
            "ipAddress": ip,
            "description": "Partner integration",
            "allowedEndpoints": ["/api/*"],
            "maxRequestsPerMinute": 2,
            "expiresAt": (Utc::now() + ChronoDuration::hours(1)).to_rfc3339(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let body: Value = created.json().await.unwrap();
    assert_eq!(body["addedBy"], "admin");

    // trusted traffic skips the adaptive quota of 1 but has its own of 2
    assert_eq!(
        fixture.get_as(ip, "/api/reports").await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        fixture.get_as(ip, "/api/reports").await.status(),
        StatusCode::NOT_FOUND
    );
    let exceeded = fixture.get_as(ip, "/api/reports").await;
    assert_eq!(exceeded.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(exceeded.headers()["x-ratelimit-limit"], "2");

    // outside the endpoint allow-list
    assert_eq!(
        fixture.get_as(ip, "/auth/session").await.status(),
        StatusCode::FORBIDDEN
    );

    let check: Value = fixture
        .admin(fixture.client.get(fixture.url(&format!("/admin/trusted-ips/{ip}"))))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(check["trusted"], true);
    assert_eq!(check["ip"], ip);

    let list: Value = fixture
        .admin(fixture.client.get(fixture.url("/admin/trusted-ips")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);

    let removed = fixture
        .admin(fixture.client.delete(fixture.url(&format!("/admin/trusted-ips/{ip}"))))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), StatusCode::NO_CONTENT);

    let missing = fixture
        .admin(fixture.client.delete(fixture.url(&format!("/admin/trusted-ips/{ip}"))))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_add_trusted_ip_validation() {
    let fixture = TestFixture::new(AdaptivePolicy::default()).await;

    let bad_ip = fixture
        .admin(fixture.client.post(fixture.url("/admin/trusted-ips")))
        .json(&json!({ "ipAddress": "not-an-ip", "description": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_ip.status(), StatusCode::BAD_REQUEST);

    let past = fixture
        .admin(fixture.client.post(fixture.url("/admin/trusted-ips")))
        .json(&json!({
            "ipAddress": "192.0.2.9",
            "description": "expired already",
            "expiresAt": (Utc::now() - ChronoDuration::hours(1)).to_rfc3339(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(past.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_session_and_logout_all_revokes_tokens() {
    let fixture = TestFixture::new(AdaptivePolicy::default()).await;
    let directory = fixture.state.tokens.directory();
    directory
        .register("user-42", "ada@example.com", Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap();
    let token = fixture
        .state
        .tokens
        .issue("user-42", "ada@example.com")
        .await
        .unwrap();

    let session = fixture
        .client
        .get(fixture.url("/auth/session"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(session.status(), StatusCode::OK);
    let body: Value = session.json().await.unwrap();
    assert_eq!(body["userId"], "user-42");
    assert_eq!(body["tokenVersion"], 1);

    let logout = fixture
        .client
        .post(fixture.url("/auth/logout-all"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(logout.status(), StatusCode::OK);
    let body: Value = logout.json().await.unwrap();
    assert_eq!(body["tokenVersion"], 2);

    let revoked = fixture
        .client
        .get(fixture.url("/auth/session"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(revoked.status(), StatusCode::UNAUTHORIZED);
    let body: Value = revoked.json().await.unwrap();
    assert_eq!(body["message"], "Invalid or expired token");
}

#[tokio::test]
async fn test_bearer_format_errors_are_distinct() {
    let fixture = TestFixture::new(AdaptivePolicy::default()).await;

    let missing: Value = fixture
        .client
        .get(fixture.url("/auth/session"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let wrong_scheme: Value = fixture
        .client
        .get(fixture.url("/auth/session"))
        .header("authorization", "Basic dXNlcjpwYXNz")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let garbage: Value = fixture
        .client
        .get(fixture.url("/auth/session"))
        .bearer_auth("not.a.jwt")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_ne!(missing["message"], wrong_scheme["message"]);
    assert_eq!(garbage["message"], "Invalid or expired token");
}

#[tokio::test]
async fn test_operator_issues_tokens_and_password_change_revokes_them() {
    let fixture = TestFixture::new(AdaptivePolicy::default()).await;

    let issued = fixture
        .admin(fixture.client.post(fixture.url("/admin/sessions")))
        .json(&json!({
            "userId": "user-77",
            "email": "grace@example.com",
            "passwordChangedAt": (Utc::now() - ChronoDuration::hours(2)).to_rfc3339(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(issued.status(), StatusCode::CREATED);
    let body: Value = issued.json().await.unwrap();
    assert_eq!(body["registered"], true);
    assert_eq!(body["tokenVersion"], 1);
    let token = body["token"].as_str().unwrap().to_string();

    // a second issue reuses the record
    let again: Value = fixture
        .admin(fixture.client.post(fixture.url("/admin/sessions")))
        .json(&json!({ "userId": "user-77", "email": "grace@example.com" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["registered"], false);

    let session = fixture
        .client
        .get(fixture.url("/auth/session"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(session.status(), StatusCode::OK);

    let changed = fixture
        .admin(
            fixture
                .client
                .post(fixture.url("/admin/users/user-77/password-changed")),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(changed.status(), StatusCode::NO_CONTENT);

    let revoked = fixture
        .client
        .get(fixture.url("/auth/session"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(revoked.status(), StatusCode::UNAUTHORIZED);

    let unknown = fixture
        .admin(
            fixture
                .client
                .post(fixture.url("/admin/users/nobody/password-changed")),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let invalid = fixture
        .admin(fixture.client.post(fixture.url("/admin/sessions")))
        .json(&json!({ "userId": "user-78", "email": "not-an-email" }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}
