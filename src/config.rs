//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//! The only required variable is `JWT_SECRET`.
//!
//! # Security Configuration
//!
//! - `JWT_SECRET`: session token signing key; at least 32 characters and not a
//!   known placeholder, or startup fails
//! - `ADMIN_API_KEY`: when set, mounts the `/admin` routes behind `X-API-Key`
//! - `TRUSTED_IPS` / `TRUSTED_IP_RANGES`: addresses that bypass adaptive limiting
//! - `TRUSTED_PROXIES`: peers whose `X-Forwarded-For` family of headers is
//!   believed (default: loopback; empty: never)
//! - `CORS_ALLOWED_ORIGINS`: comma-separated list of allowed origins (default: `*`)
//!
//! # Shared Store
//!
//! - `REDIS_URL`: unset selects the in-process memory store (single instance only)
//! - `STORE_TIMEOUT_MS`: per round-trip deadline (default: 250)
//! - `STORE_FAILURE_POLICY`: `open` lets traffic through while the store is
//!   down, `closed` answers 503 (default: `open`)
//!
//! # Adaptive Limiting
//!
//! - `RATE_LIMIT_WINDOW_MS` / `RATE_LIMIT_MAX_REQUESTS`: base quota (default: 100 per 15 min)
//! - `TRUST_THRESHOLD` / `SUSPICION_THRESHOLD`: score cut-offs (default: 70 / 50)
//! - `VIOLATION_BAN_THRESHOLD` / `BAN_DURATION_SECS`: ban policy (default: 10 / 3600)

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::ip::{DEFAULT_TRUSTED_PROXIES, TrustedProxies};
use crate::services::trusted_ips::parse_ranges;
use crate::services::{AdaptivePolicy, IpRange, JwtSecret};
use crate::store::CircuitBreakerConfig;

/// What the trust gate does when the store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailurePolicy {
    /// Let the request through unlimited.
    #[default]
    Open,
    /// Reject the request with 503.
    Closed,
}

impl StoreFailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreFailurePolicy::Open => "open",
            StoreFailurePolicy::Closed => "closed",
        }
    }
}

impl fmt::Display for StoreFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(StoreFailurePolicy::Open),
            "closed" => Ok(StoreFailurePolicy::Closed),
            other => Err(format!("expected `open` or `closed`, got `{other}`")),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Outer deadline for a whole request, store round trips included (default: 10s)
    pub request_timeout: Duration,

    /// Maximum request body size in bytes (default: 64KB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Store Configuration
    // =========================================================================
    /// Redis connection URL; `None` selects the memory store
    pub redis_url: Option<String>,

    /// Deadline for a single store round trip (default: 250ms)
    pub store_timeout: Duration,

    pub store_failure_policy: StoreFailurePolicy,

    /// Consecutive store failures before the circuit opens (default: 5)
    pub store_circuit_failure_threshold: u32,

    /// How long the circuit stays open before a trial call (default: 30s)
    pub store_circuit_open_duration: Duration,

    // =========================================================================
    // Trust Configuration
    // =========================================================================
    /// Literal trusted addresses; loopback is always trusted on top of these
    pub trusted_ips: Vec<String>,

    /// Trusted IPv4 ranges, malformed entries already dropped
    pub trusted_ip_ranges: Vec<IpRange>,

    /// Peers allowed to name the client through proxy headers
    pub trusted_proxies: TrustedProxies,

    /// Adaptive quota policy
    pub adaptive: AdaptivePolicy,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Session token signing key (required)
    pub jwt_secret: Option<JwtSecret>,

    /// Lifetime of issued session tokens (default: 7 days)
    pub jwt_expires_in: Duration,

    /// Admin API key; the `/admin` routes exist only when set
    pub admin_api_key: Option<String>,

    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse, if
    /// `JWT_SECRET` is missing, a placeholder or too short, or if
    /// [`Config::validate`] rejects the combination.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let jwt_secret = JwtSecret::new(env::var("JWT_SECRET").unwrap_or_default())
            .map_err(|e| AppError::ConfigError(e.to_string()))?;

        let defaults = AdaptivePolicy::default();
        let adaptive = AdaptivePolicy {
            window_ms: Self::parse_env("RATE_LIMIT_WINDOW_MS", defaults.window_ms)?,
            max_requests: Self::parse_env("RATE_LIMIT_MAX_REQUESTS", defaults.max_requests)?,
            trust_threshold: Self::parse_env("TRUST_THRESHOLD", defaults.trust_threshold)?,
            suspicion_threshold: Self::parse_env(
                "SUSPICION_THRESHOLD",
                defaults.suspicion_threshold,
            )?,
            trust_bonus_multiplier: Self::parse_env(
                "TRUST_BONUS_MULTIPLIER",
                defaults.trust_bonus_multiplier,
            )?,
            suspicion_penalty_divisor: Self::parse_env(
                "SUSPICION_PENALTY_DIVISOR",
                defaults.suspicion_penalty_divisor,
            )?,
            burst_allowance: Self::parse_env("BURST_ALLOWANCE", defaults.burst_allowance)?,
            ban_threshold: Self::parse_env("VIOLATION_BAN_THRESHOLD", defaults.ban_threshold)?,
            ban_duration: Duration::from_secs(Self::parse_env(
                "BAN_DURATION_SECS",
                defaults.ban_duration.as_secs(),
            )?),
        };

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            request_timeout: Duration::from_millis(Self::parse_env("REQUEST_TIMEOUT_MS", 10_000)?),
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 64 * 1024)?,

            // Store
            redis_url: env::var("REDIS_URL").ok().filter(|u| !u.trim().is_empty()),
            store_timeout: Duration::from_millis(Self::parse_env("STORE_TIMEOUT_MS", 250)?),
            store_failure_policy: Self::parse_env(
                "STORE_FAILURE_POLICY",
                StoreFailurePolicy::Open,
            )?,
            store_circuit_failure_threshold: Self::parse_env(
                "STORE_CIRCUIT_FAILURE_THRESHOLD",
                5,
            )?,
            store_circuit_open_duration: Duration::from_secs(Self::parse_env(
                "STORE_CIRCUIT_OPEN_SECS",
                30,
            )?),

            // Trust
            trusted_ips: Self::parse_list("TRUSTED_IPS", ""),
            trusted_ip_ranges: parse_ranges(&env::var("TRUSTED_IP_RANGES").unwrap_or_default()),
            trusted_proxies: TrustedProxies::parse(
                &env::var("TRUSTED_PROXIES").unwrap_or_else(|_| DEFAULT_TRUSTED_PROXIES.to_string()),
            ),
            adaptive,

            // Security
            jwt_secret: Some(jwt_secret),
            jwt_expires_in: Duration::from_secs(Self::parse_env(
                "JWT_EXPIRES_IN_SECS",
                7 * 24 * 60 * 60,
            )?),
            admin_api_key: env::var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty()),
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        let fail = |msg: &str| Err(AppError::ConfigError(msg.to_string()));

        if self.jwt_secret.is_none() {
            return fail("JWT_SECRET is not set");
        }
        if self.jwt_expires_in.is_zero() {
            return fail("JWT_EXPIRES_IN_SECS must be greater than 0");
        }
        if self.store_timeout.is_zero() {
            return fail("STORE_TIMEOUT_MS must be greater than 0");
        }
        if self.store_timeout >= self.request_timeout {
            return Err(AppError::ConfigError(format!(
                "STORE_TIMEOUT_MS ({:?}) must be shorter than REQUEST_TIMEOUT_MS ({:?})",
                self.store_timeout, self.request_timeout
            )));
        }
        if self.store_circuit_failure_threshold == 0 {
            return fail("STORE_CIRCUIT_FAILURE_THRESHOLD must be greater than 0");
        }
        if self.adaptive.window_ms == 0 {
            return fail("RATE_LIMIT_WINDOW_MS must be greater than 0");
        }
        if self.adaptive.max_requests == 0 {
            return fail("RATE_LIMIT_MAX_REQUESTS must be greater than 0");
        }
        for (name, value) in [
            ("TRUST_THRESHOLD", self.adaptive.trust_threshold),
            ("SUSPICION_THRESHOLD", self.adaptive.suspicion_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(AppError::ConfigError(format!(
                    "{name} must lie in 0..=100 (got {value})"
                )));
            }
        }
        let at_least_one = |v: f64| !v.is_nan() && v >= 1.0;
        if !at_least_one(self.adaptive.trust_bonus_multiplier) {
            return fail("TRUST_BONUS_MULTIPLIER must be at least 1");
        }
        if !at_least_one(self.adaptive.suspicion_penalty_divisor) {
            return fail("SUSPICION_PENALTY_DIVISOR must be at least 1");
        }
        if self.adaptive.ban_duration.is_zero() {
            return fail("BAN_DURATION_SECS must be greater than 0");
        }
        if self.max_request_body_size == 0 {
            return fail("MAX_REQUEST_BODY_SIZE must be greater than 0");
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the admin API is enabled.
    pub fn admin_enabled(&self) -> bool {
        self.admin_api_key.is_some()
    }

    /// Circuit breaker settings for the guarded store.
    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.store_circuit_failure_threshold,
            open_duration: self.store_circuit_open_duration,
            ..CircuitBreakerConfig::default()
        }
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated list, dropping empty entries.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        split_list(&env::var(name).unwrap_or_else(|_| default.to_string()))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Has no signing secret, so it fails [`Config::validate`] until one is set.
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            request_timeout: Duration::from_secs(10),
            max_request_body_size: 64 * 1024,
            // Store
            redis_url: None,
            store_timeout: Duration::from_millis(250),
            store_failure_policy: StoreFailurePolicy::Open,
            store_circuit_failure_threshold: 5,
            store_circuit_open_duration: Duration::from_secs(30),
            // Trust
            trusted_ips: vec![],
            trusted_ip_ranges: vec![],
            trusted_proxies: TrustedProxies::loopback(),
            adaptive: AdaptivePolicy::default(),
            // Security
            jwt_secret: None,
            jwt_expires_in: Duration::from_secs(7 * 24 * 60 * 60),
            admin_api_key: None,
            cors_allowed_origins: vec!["*".to_string()],
            // Observability
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            jwt_secret: Some(JwtSecret::new("k9Vx2LqP7mZ4rT8wY1nB6cD3fG5hJ0sA").unwrap()),
            ..Config::default()
        }
    }

    fn rejection(config: Config) -> String {
        config.validate().unwrap_err().to_string()
    }

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.store_failure_policy, StoreFailurePolicy::Open);
        assert_eq!(config.adaptive.max_requests, 100);
        assert_eq!(config.adaptive.window_ms, 900_000);
        assert!(!config.admin_enabled());
        assert!(config.redis_url.is_none());
        assert!(config.trusted_proxies.contains("127.0.0.1".parse().unwrap()));
        assert!(!config.trusted_proxies.contains("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "192.168.1.1".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "192.168.1.1:8080");
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!("open".parse(), Ok(StoreFailurePolicy::Open));
        assert_eq!(" CLOSED ".parse(), Ok(StoreFailurePolicy::Closed));
        assert!("sometimes".parse::<StoreFailurePolicy>().is_err());
        assert_eq!(StoreFailurePolicy::Closed.to_string(), "closed");
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(" 10.0.0.1, ,192.168.1.5 "),
            vec!["10.0.0.1".to_string(), "192.168.1.5".to_string()]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_secret() {
        assert!(rejection(Config::default()).contains("JWT_SECRET"));
    }

    #[test]
    fn test_validate_store_timeout_ordering() {
        let config = Config {
            store_timeout: Duration::from_secs(20),
            ..valid()
        };
        assert!(rejection(config).contains("STORE_TIMEOUT_MS"));
    }

    #[test]
    fn test_validate_adaptive_policy() {
        let mut config = valid();
        config.adaptive.max_requests = 0;
        assert!(rejection(config).contains("RATE_LIMIT_MAX_REQUESTS"));

        let mut config = valid();
        config.adaptive.trust_threshold = 140.0;
        assert!(rejection(config).contains("TRUST_THRESHOLD"));

        let mut config = valid();
        config.adaptive.suspicion_penalty_divisor = f64::NAN;
        assert!(rejection(config).contains("SUSPICION_PENALTY_DIVISOR"));
    }

    #[test]
    fn test_circuit_breaker_settings() {
        let config = Config {
            store_circuit_failure_threshold: 3,
            store_circuit_open_duration: Duration::from_secs(12),
            ..valid()
        };
        let breaker = config.circuit_breaker();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.open_duration, Duration::from_secs(12));
        assert_eq!(breaker.success_threshold, 2);
    }

    #[test]
    fn test_metrics_addr() {
        assert!(valid().metrics_addr().is_some());
        let config = Config {
            metrics_port: 0,
            ..valid()
        };
        assert!(config.metrics_addr().is_none());
    }
}
