//! Trusted client IPs.
//!
//! Resolution order for an address:
//!
//! 1. normalise (first forwarded entry, trimmed, `::ffff:` stripped)
//! 2. static set from `TRUSTED_IPS`, always including loopback
//! 3. IPv4 ranges from `TRUSTED_IP_RANGES` (integer containment)
//! 4. dynamic entries under `trusted_ip:{ip}` in the shared store
//!
//! Steps 2 and 3 never touch the store. Dynamic entries past `expiresAt` are
//! deleted when read.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::store::{RateLimitStore, keys};

const MINUTE_MS: u64 = 60_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("`{0}` is not a dotted-quad IPv4 address")]
    InvalidAddress(String),
    #[error("`{0}` is not a prefix length between 0 and 32")]
    InvalidPrefix(String),
}

/// Inclusive IPv4 range parsed from CIDR notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpRange {
    pub start: u32,
    pub end: u32,
    pub cidr: String,
}

impl IpRange {
    /// Parse `a.b.c.d/n`. A bare address is a `/32`.
    pub fn parse(cidr: &str) -> Result<Self, CidrError> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => {
                let bits = prefix
                    .parse::<u8>()
                    .ok()
                    .filter(|bits| *bits <= 32)
                    .ok_or_else(|| CidrError::InvalidPrefix(prefix.to_string()))?;
                (addr, bits)
            }
            None => (cidr, 32),
        };
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| CidrError::InvalidAddress(addr.to_string()))?;

        let mask = prefix_mask(prefix);
        let network = u32::from(addr) & mask;
        let broadcast = network | !mask;
        Ok(Self {
            start: network,
            end: broadcast,
            cidr: cidr.to_string(),
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        self.start <= ip && ip <= self.end
    }
}

/// Network mask for a prefix length in `0..=32`.
pub fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

/// Parse a comma-separated range list, skipping malformed entries.
pub fn parse_ranges(list: &str) -> Vec<IpRange> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match IpRange::parse(entry) {
            Ok(range) => Some(range),
            Err(e) => {
                warn!(cidr = entry, error = %e, "Skipping malformed trusted IP range");
                None
            }
        })
        .collect()
}

/// Normalised form of a client address as found in headers.
pub fn normalize_ip(raw: &str) -> String {
    let first = raw.split(',').next().unwrap_or_default().trim();
    match first.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("::ffff:") && first.len() > 7 => {
            first.get(7..).unwrap_or(first).to_string()
        }
        _ => first.to_string(),
    }
}

/// Normalised address in canonical textual form. Unparsable input is
/// returned normalised but otherwise unchanged.
pub fn canonical_ip(raw: &str) -> String {
    let normalized = normalize_ip(raw);
    match normalized.parse::<IpAddr>() {
        Ok(addr) => addr.to_canonical().to_string(),
        Err(_) => normalized,
    }
}

/// Compile an endpoint glob (`*` matches anything) to an anchored regex.
pub fn compile_endpoint_glob(glob: &str) -> Result<Regex, regex::Error> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$"))
}

/// Globs compiled so far, shared by every clone of a registry. Patterns only
/// come from operator-added entries; the cache is reset past
/// [`MAX_CACHED_GLOBS`].
#[derive(Default)]
struct GlobCache {
    compiled: DashMap<String, Option<Regex>>,
}

/// Upper bound on cached compiled globs.
pub const MAX_CACHED_GLOBS: usize = 4096;

impl GlobCache {
    fn matches(&self, glob: &str, endpoint: &str) -> bool {
        if let Some(re) = self.compiled.get(glob) {
            return re.as_ref().is_some_and(|re| re.is_match(endpoint));
        }
        let re = match compile_endpoint_glob(glob) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %glob, error = %e, "Skipping invalid endpoint pattern");
                None
            }
        };
        let matched = re.as_ref().is_some_and(|re| re.is_match(endpoint));
        if self.compiled.len() >= MAX_CACHED_GLOBS {
            self.compiled.clear();
        }
        self.compiled.insert(glob.to_string(), re);
        matched
    }

    fn allows(&self, patterns: &[String], endpoint: &str) -> bool {
        patterns.iter().any(|glob| self.matches(glob, endpoint))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.compiled.len()
    }
}

/// Dynamic trusted-IP entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedIpConfig {
    pub ip_address: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_endpoints: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_minute: Option<u32>,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
}

mod fields {
    pub const IP_ADDRESS: &str = "ip_address";
    pub const DESCRIPTION: &str = "description";
    pub const EXPIRES_AT: &str = "expires_at";
    pub const ALLOWED_ENDPOINTS: &str = "allowed_endpoints";
    pub const MAX_REQUESTS_PER_MINUTE: &str = "max_requests_per_minute";
    pub const ADDED_BY: &str = "added_by";
    pub const ADDED_AT: &str = "added_at";
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl TrustedIpConfig {
    fn to_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut out = vec![
            (fields::IP_ADDRESS, self.ip_address.clone()),
            (fields::DESCRIPTION, self.description.clone()),
            (fields::ADDED_BY, self.added_by.clone()),
            (fields::ADDED_AT, timestamp(&self.added_at)),
        ];
        if let Some(at) = &self.expires_at {
            out.push((fields::EXPIRES_AT, timestamp(at)));
        }
        if let Some(endpoints) = &self.allowed_endpoints {
            out.push((fields::ALLOWED_ENDPOINTS, serde_json::to_string(endpoints)?));
        }
        if let Some(max) = self.max_requests_per_minute {
            out.push((fields::MAX_REQUESTS_PER_MINUTE, max.to_string()));
        }
        Ok(out)
    }

    /// Decode a stored hash, rejecting missing or unparsable fields.
    pub fn from_fields(key: &str, raw: &HashMap<String, String>) -> StoreResult<Self> {
        let malformed = |reason: String| StoreError::Malformed {
            key: key.to_string(),
            reason,
        };
        let required = |field: &str| {
            raw.get(field)
                .cloned()
                .ok_or_else(|| malformed(format!("missing field `{field}`")))
        };
        let parse_time = |field: &str, value: &str| {
            DateTime::parse_from_rfc3339(value)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| malformed(format!("field `{field}`: {e}")))
        };

        let added_at = parse_time(fields::ADDED_AT, &required(fields::ADDED_AT)?)?;
        let expires_at = raw
            .get(fields::EXPIRES_AT)
            .map(|v| parse_time(fields::EXPIRES_AT, v))
            .transpose()?;
        let allowed_endpoints = raw
            .get(fields::ALLOWED_ENDPOINTS)
            .map(|v| {
                serde_json::from_str::<Vec<String>>(v)
                    .map_err(|e| malformed(format!("field `allowed_endpoints`: {e}")))
            })
            .transpose()?;
        let max_requests_per_minute = raw
            .get(fields::MAX_REQUESTS_PER_MINUTE)
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|_| malformed(format!("field `max_requests_per_minute`: `{v}`")))
            })
            .transpose()?;

        Ok(Self {
            ip_address: required(fields::IP_ADDRESS)?,
            description: required(fields::DESCRIPTION)?,
            expires_at,
            allowed_endpoints,
            max_requests_per_minute,
            added_by: required(fields::ADDED_BY)?,
            added_at,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustReason {
    StaticList,
    Range,
    Dynamic,
    Expired,
    NotTrusted,
    InvalidIp,
}

impl TrustReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustReason::StaticList => "IP in static trusted list",
            TrustReason::Range => "IP in trusted range",
            TrustReason::Dynamic => "IP in dynamic trusted list",
            TrustReason::Expired => "Trusted IP entry expired",
            TrustReason::NotTrusted => "IP not trusted",
            TrustReason::InvalidIp => "Invalid IP address",
        }
    }

    /// Metric label.
    pub fn label(self) -> &'static str {
        match self {
            TrustReason::StaticList => "static",
            TrustReason::Range => "range",
            TrustReason::Dynamic => "dynamic",
            TrustReason::Expired => "expired",
            TrustReason::NotTrusted => "not_trusted",
            TrustReason::InvalidIp => "invalid_ip",
        }
    }
}

impl Serialize for TrustReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Result of [`TrustedIpRegistry::is_trusted`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustCheck {
    pub trusted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<TrustedIpConfig>,
    pub reason: TrustReason,
}

impl TrustCheck {
    fn untrusted(reason: TrustReason) -> Self {
        Self {
            trusted: false,
            config: None,
            reason,
        }
    }

    fn trusted(reason: TrustReason, config: Option<TrustedIpConfig>) -> Self {
        Self {
            trusted: true,
            config,
            reason,
        }
    }
}

/// Result of [`TrustedIpRegistry::check_trusted_ip_rate_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustedRateDecision {
    /// Not trusted; the adaptive limiter applies.
    NotTrusted,
    /// Trusted, but the endpoint is outside the entry's allow-list.
    EndpointNotAllowed,
    Allowed {
        /// `None` without a custom per-minute quota.
        remaining: Option<u64>,
    },
    Exceeded {
        limit: u32,
        retry_after: Duration,
    },
}

enum DynamicEntry {
    Live(TrustedIpConfig),
    Expired,
    Absent,
}

#[derive(Clone)]
pub struct TrustedIpRegistry {
    static_ips: Arc<HashSet<IpAddr>>,
    ranges: Arc<[IpRange]>,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    globs: Arc<GlobCache>,
}

impl TrustedIpRegistry {
    /// Build from configured literal IPs and ranges. Loopback is always
    /// trusted; malformed entries are logged and skipped.
    pub fn new(
        trusted_ips: &[String],
        ranges: Vec<IpRange>,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut static_ips: HashSet<IpAddr> = [
            IpAddr::from(Ipv4Addr::LOCALHOST),
            IpAddr::from(std::net::Ipv6Addr::LOCALHOST),
        ]
        .into_iter()
        .collect();
        for raw in trusted_ips {
            match normalize_ip(raw).parse::<IpAddr>() {
                Ok(ip) => {
                    static_ips.insert(ip);
                }
                Err(_) => warn!(ip = %raw, "Skipping malformed trusted IP"),
            }
        }
        info!(
            static_ips = static_ips.len(),
            ranges = ranges.len(),
            "Trusted IP registry initialized"
        );
        Self {
            static_ips: Arc::new(static_ips),
            ranges: ranges.into(),
            store,
            clock,
            globs: Arc::new(GlobCache::default()),
        }
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    pub async fn is_trusted(&self, ip: &str) -> StoreResult<TrustCheck> {
        let check = self.resolve(ip).await?;
        metrics::record_trusted_ip_check(check.reason.label());
        Ok(check)
    }

    async fn resolve(&self, ip: &str) -> StoreResult<TrustCheck> {
        let normalized = normalize_ip(ip);
        let Ok(addr) = normalized.parse::<IpAddr>().map(|a| a.to_canonical()) else {
            return Ok(TrustCheck::untrusted(TrustReason::InvalidIp));
        };

        if self.static_ips.contains(&addr) {
            return Ok(TrustCheck::trusted(TrustReason::StaticList, None));
        }
        if let IpAddr::V4(v4) = addr
            && self.ranges.iter().any(|r| r.contains(v4))
        {
            return Ok(TrustCheck::trusted(TrustReason::Range, None));
        }

        match self.load_dynamic(&addr.to_string()).await? {
            DynamicEntry::Live(config) => {
                Ok(TrustCheck::trusted(TrustReason::Dynamic, Some(config)))
            }
            DynamicEntry::Expired => Ok(TrustCheck::untrusted(TrustReason::Expired)),
            DynamicEntry::Absent => Ok(TrustCheck::untrusted(TrustReason::NotTrusted)),
        }
    }

    async fn load_dynamic(&self, ip: &str) -> StoreResult<DynamicEntry> {
        let key = keys::trusted_ip(ip);
        let raw = self.store.hash_get_all(&key).await?;
        if raw.is_empty() {
            return Ok(DynamicEntry::Absent);
        }
        let config = match TrustedIpConfig::from_fields(&key, &raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed trusted IP entry");
                return Ok(DynamicEntry::Absent);
            }
        };
        if config.is_expired(self.clock.now_utc()) {
            self.store.delete(&key).await?;
            debug!(ip, "Expired trusted IP entry deleted");
            return Ok(DynamicEntry::Expired);
        }
        Ok(DynamicEntry::Live(config))
    }

    /// Store a dynamic entry, replacing any existing one for the address.
    pub async fn add_trusted_ip(&self, mut config: TrustedIpConfig) -> StoreResult<TrustedIpConfig> {
        config.ip_address = canonical_ip(&config.ip_address);
        let key = keys::trusted_ip(&config.ip_address);
        let fields = config.to_fields().map_err(|e| StoreError::Malformed {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let ttl = config.expires_at.map(|expires_at| {
            let ttl_ms = (expires_at - self.clock.now_utc()).num_milliseconds().max(1);
            Duration::from_millis(ttl_ms as u64)
        });
        self.store.hash_replace(&key, &fields, ttl).await?;
        info!(
            ip = %config.ip_address,
            added_by = %config.added_by,
            expires_at = ?config.expires_at,
            "Trusted IP added"
        );
        Ok(config)
    }

    pub async fn remove_trusted_ip(&self, ip: &str) -> StoreResult<bool> {
        let ip = canonical_ip(ip);
        let removed = self.store.delete(&keys::trusted_ip(&ip)).await?;
        if removed {
            info!(ip = %ip, "Trusted IP removed");
        }
        Ok(removed)
    }

    /// Live dynamic entries, sorted by address.
    pub async fn list_trusted_ips(&self) -> StoreResult<Vec<TrustedIpConfig>> {
        let mut out = Vec::new();
        for key in self.store.keys_with_prefix(keys::TRUSTED_IP_PREFIX).await? {
            let Some(ip) = key.strip_prefix(keys::TRUSTED_IP_PREFIX) else {
                continue;
            };
            if let DynamicEntry::Live(config) = self.load_dynamic(ip).await? {
                out.push(config);
            }
        }
        out.sort_by(|a, b| a.ip_address.cmp(&b.ip_address));
        Ok(out)
    }

    /// Enforce the endpoint allow-list and custom per-minute quota of a
    /// trusted address.
    pub async fn check_trusted_ip_rate_limit(
        &self,
        ip: &str,
        endpoint: &str,
    ) -> StoreResult<TrustedRateDecision> {
        let check = self.is_trusted(ip).await?;
        self.rate_limit_for(&check, ip, endpoint).await
    }

    /// Same as [`Self::check_trusted_ip_rate_limit`] for an address already
    /// resolved with [`Self::is_trusted`].
    pub async fn rate_limit_for(
        &self,
        check: &TrustCheck,
        ip: &str,
        endpoint: &str,
    ) -> StoreResult<TrustedRateDecision> {
        if !check.trusted {
            return Ok(TrustedRateDecision::NotTrusted);
        }
        let Some(config) = &check.config else {
            return Ok(TrustedRateDecision::Allowed { remaining: None });
        };

        if let Some(patterns) = &config.allowed_endpoints
            && !self.globs.allows(patterns, endpoint)
        {
            return Ok(TrustedRateDecision::EndpointNotAllowed);
        }

        let Some(limit) = config.max_requests_per_minute else {
            return Ok(TrustedRateDecision::Allowed { remaining: None });
        };
        let now = self.clock.now_ms();
        let bucket = now / MINUTE_MS;
        let key = keys::trusted_ip_rate(&canonical_ip(ip), bucket);
        let count = self
            .store
            .incr_with_ttl(&key, Duration::from_millis(MINUTE_MS))
            .await?;
        let count = u64::try_from(count).unwrap_or(0);

        if count > u64::from(limit) {
            let next_minute = (bucket + 1) * MINUTE_MS;
            return Ok(TrustedRateDecision::Exceeded {
                limit,
                retry_after: Duration::from_millis(next_minute - now),
            });
        }
        Ok(TrustedRateDecision::Allowed {
            remaining: Some(u64::from(limit) - count),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn registry(ips: &[&str], ranges: &str) -> (TrustedIpRegistry, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let ips: Vec<String> = ips.iter().map(|s| s.to_string()).collect();
        let registry = TrustedIpRegistry::new(
            &ips,
            parse_ranges(ranges),
            store.clone(),
            Arc::new(clock.clone()),
        );
        (registry, store, clock)
    }

    fn entry(ip: &str, clock: &ManualClock) -> TrustedIpConfig {
        TrustedIpConfig {
            ip_address: ip.to_string(),
            description: "office VPN".to_string(),
            expires_at: None,
            allowed_endpoints: None,
            max_requests_per_minute: None,
            added_by: "ops".to_string(),
            added_at: clock.now_utc(),
        }
    }

    #[test]
    fn test_parse_cidr() {
        let r = IpRange::parse("192.168.1.0/24").unwrap();
        assert_eq!(r.start, u32::from(Ipv4Addr::new(192, 168, 1, 0)));
        assert_eq!(r.end, u32::from(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(r.contains(Ipv4Addr::new(192, 168, 1, 10)));
        assert!(!r.contains(Ipv4Addr::new(192, 168, 2, 10)));

        // host bits are masked off
        let r = IpRange::parse("10.1.2.3/8").unwrap();
        assert_eq!(r.start, u32::from(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(r.end, u32::from(Ipv4Addr::new(10, 255, 255, 255)));

        let all = IpRange::parse("0.0.0.0/0").unwrap();
        assert_eq!((all.start, all.end), (0, u32::MAX));

        let single = IpRange::parse("8.8.8.8").unwrap();
        assert_eq!(single.start, single.end);
    }

    #[test]
    fn test_parse_cidr_rejects_malformed() {
        assert!(matches!(
            IpRange::parse("10.0.0/24"),
            Err(CidrError::InvalidAddress(_))
        ));
        assert!(matches!(
            IpRange::parse("10.0.0.0/33"),
            Err(CidrError::InvalidPrefix(_))
        ));
        assert!(matches!(
            IpRange::parse("10.0.0.0/-1"),
            Err(CidrError::InvalidPrefix(_))
        ));
        assert!(IpRange::parse("fe80::/10").is_err());
        assert_eq!(parse_ranges("10.0.0.0/8, nope/4, ,172.16.0.0/12").len(), 2);
    }

    #[test]
    fn test_normalize_ip() {
        assert_eq!(normalize_ip("::ffff:192.168.1.5"), "192.168.1.5");
        assert_eq!(normalize_ip("::FFFF:10.0.0.1"), "10.0.0.1");
        assert_eq!(normalize_ip(" 203.0.113.7 , 10.0.0.1"), "203.0.113.7");
        assert_eq!(normalize_ip("2001:db8::1"), "2001:db8::1");
        assert_eq!(normalize_ip(""), "");
    }

    #[test]
    fn test_endpoint_glob() {
        let re = compile_endpoint_glob("/api/reports/*").unwrap();
        assert!(re.is_match("/api/reports/2024/q1"));
        assert!(!re.is_match("/api/report"));
        assert!(!re.is_match("/v2/api/reports/x"));

        let re = compile_endpoint_glob("/health.json").unwrap();
        assert!(!re.is_match("/healthxjson"));
    }

    #[tokio::test]
    async fn test_range_match_needs_no_store() {
        let (registry, store, _) = registry(&[], "10.0.0.0/24");
        let check = registry.is_trusted("10.0.0.5").await.unwrap();
        assert!(check.trusted);
        assert_eq!(check.reason.as_str(), "IP in trusted range");
        assert!(check.config.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_static_and_loopback() {
        let (registry, _, _) = registry(&["203.0.113.9", "garbage"], "");
        for ip in ["127.0.0.1", "::1", "203.0.113.9", "::ffff:203.0.113.9"] {
            let check = registry.is_trusted(ip).await.unwrap();
            assert_eq!(check.reason, TrustReason::StaticList, "{ip}");
        }
        let check = registry.is_trusted("not-an-ip").await.unwrap();
        assert_eq!(check.reason, TrustReason::InvalidIp);
        let check = registry.is_trusted("198.51.100.1").await.unwrap();
        assert_eq!(check.reason, TrustReason::NotTrusted);
    }

    #[tokio::test]
    async fn test_dynamic_entry_lifecycle() {
        let (registry, _, clock) = registry(&[], "");
        registry
            .add_trusted_ip(entry("198.51.100.20", &clock))
            .await
            .unwrap();

        let check = registry.is_trusted("198.51.100.20").await.unwrap();
        assert_eq!(check.reason, TrustReason::Dynamic);
        assert_eq!(check.config.unwrap().description, "office VPN");
        assert_eq!(registry.list_trusted_ips().await.unwrap().len(), 1);

        assert!(registry.remove_trusted_ip("198.51.100.20").await.unwrap());
        assert!(!registry.remove_trusted_ip("198.51.100.20").await.unwrap());
        assert!(!registry.is_trusted("198.51.100.20").await.unwrap().trusted);
    }

    #[tokio::test]
    async fn test_expired_entry_is_deleted_on_read() {
        let (registry, store, clock) = registry(&[], "");
        let mut config = entry("198.51.100.30", &clock);
        config.expires_at = Some(clock.now_utc() + chrono::Duration::minutes(10));
        registry.add_trusted_ip(config.clone()).await.unwrap();

        // Remove the store TTL so only the lazy check can expire it.
        let key = keys::trusted_ip("198.51.100.30");
        store.delete(&key).await.unwrap();
        store
            .hash_set(&key, &config.to_fields().unwrap())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(11 * 60));
        let check = registry.is_trusted("198.51.100.30").await.unwrap();
        assert!(!check.trusted);
        assert_eq!(check.reason, TrustReason::Expired);
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_not_trusted() {
        let (registry, store, _) = registry(&[], "");
        store
            .hash_set(
                &keys::trusted_ip("198.51.100.40"),
                &[("ip_address", "198.51.100.40".to_string())],
            )
            .await
            .unwrap();
        let check = registry.is_trusted("198.51.100.40").await.unwrap();
        assert_eq!(check.reason, TrustReason::NotTrusted);
    }

    #[tokio::test]
    async fn test_endpoint_allow_list() {
        let (registry, _, clock) = registry(&[], "");
        let mut config = entry("198.51.100.50", &clock);
        config.allowed_endpoints = Some(vec!["/api/reports/*".to_string()]);
        registry.add_trusted_ip(config).await.unwrap();

        assert_eq!(
            registry
                .check_trusted_ip_rate_limit("198.51.100.50", "/api/reports/daily")
                .await
                .unwrap(),
            TrustedRateDecision::Allowed { remaining: None }
        );
        assert_eq!(
            registry
                .check_trusted_ip_rate_limit("198.51.100.50", "/api/accounts")
                .await
                .unwrap(),
            TrustedRateDecision::EndpointNotAllowed
        );
        assert_eq!(
            registry
                .check_trusted_ip_rate_limit("198.51.100.51", "/api/accounts")
                .await
                .unwrap(),
            TrustedRateDecision::NotTrusted
        );
    }

    #[tokio::test]
    async fn test_endpoint_globs_compile_once() {
        let (registry, _, clock) = registry(&[], "");
        let mut config = entry("198.51.100.55", &clock);
        config.allowed_endpoints = Some(vec![
            "/api/public/*".to_string(),
            "/status".to_string(),
            "/metrics[v2]".to_string(),
        ]);
        registry.add_trusted_ip(config).await.unwrap();

        for _ in 0..3 {
            for (endpoint, expected) in [
                ("/api/public/feed", TrustedRateDecision::Allowed { remaining: None }),
                ("/status", TrustedRateDecision::Allowed { remaining: None }),
                ("/api/private", TrustedRateDecision::EndpointNotAllowed),
            ] {
                assert_eq!(
                    registry
                        .check_trusted_ip_rate_limit("198.51.100.55", endpoint)
                        .await
                        .unwrap(),
                    expected,
                    "{endpoint}"
                );
            }
            assert_eq!(registry.globs.len(), 3);
        }
        assert_eq!(registry.clone().globs.len(), 3);
    }

    #[tokio::test]
    async fn test_replacing_an_entry_drops_stale_fields() {
        let (registry, store, clock) = registry(&[], "");
        let key = keys::trusted_ip("198.51.100.70");
        let mut first = entry("198.51.100.70", &clock);
        first.allowed_endpoints = Some(vec!["/api/*".to_string()]);
        first.max_requests_per_minute = Some(5);
        first.expires_at = Some(clock.now_utc() + chrono::Duration::minutes(5));
        registry.add_trusted_ip(first).await.unwrap();
        assert_eq!(
            store.ttl(&key).await.unwrap(),
            Some(Duration::from_secs(300))
        );

        let mut second = entry("198.51.100.70", &clock);
        second.description = "build farm".to_string();
        registry.add_trusted_ip(second).await.unwrap();

        let fields = store.hash_get_all(&key).await.unwrap();
        assert!(!fields.contains_key("allowed_endpoints"));
        assert!(!fields.contains_key("max_requests_per_minute"));
        assert!(!fields.contains_key("expires_at"));
        assert_eq!(store.ttl(&key).await.unwrap(), None);

        let config = registry
            .is_trusted("198.51.100.70")
            .await
            .unwrap()
            .config
            .unwrap();
        assert_eq!(config.description, "build farm");
        assert_eq!(config.allowed_endpoints, None);
        assert_eq!(config.max_requests_per_minute, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readers_never_see_a_replaced_entry_missing() {
        let (registry, _, clock) = registry(&[], "");
        registry
            .add_trusted_ip(entry("198.51.100.71", &clock))
            .await
            .unwrap();

        let writer = {
            let registry = registry.clone();
            let clock = clock.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    let mut config = entry("198.51.100.71", &clock);
                    config.description = format!("rev {i}");
                    registry.add_trusted_ip(config).await.unwrap();
                }
            })
        };
        while !writer.is_finished() {
            let check = registry.is_trusted("198.51.100.71").await.unwrap();
            assert_eq!(check.reason, TrustReason::Dynamic);
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_custom_quota_per_minute() {
        let (registry, _, clock) = registry(&[], "");
        // 40s into a minute
        clock.set_ms(1_700_000_080_000);
        let mut config = entry("198.51.100.60", &clock);
        config.max_requests_per_minute = Some(2);
        registry.add_trusted_ip(config).await.unwrap();

        for remaining in [1, 0] {
            assert_eq!(
                registry
                    .check_trusted_ip_rate_limit("198.51.100.60", "/x")
                    .await
                    .unwrap(),
                TrustedRateDecision::Allowed {
                    remaining: Some(remaining)
                }
            );
        }
        assert_eq!(
            registry
                .check_trusted_ip_rate_limit("198.51.100.60", "/x")
                .await
                .unwrap(),
            TrustedRateDecision::Exceeded {
                limit: 2,
                retry_after: Duration::from_secs(20),
            }
        );

        clock.advance(Duration::from_secs(20));
        assert!(matches!(
            registry
                .check_trusted_ip_rate_limit("198.51.100.60", "/x")
                .await
                .unwrap(),
            TrustedRateDecision::Allowed { .. }
        ));
    }
}
