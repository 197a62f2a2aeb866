//! Client IP resolution for the trust gate and the auth throttles.
//!
//! # Resolution order
//!
//! 1. Proxy headers, in fixed priority order ([`CLIENT_IP_HEADERS`]), but
//!    only when the transport peer is a [`TrustedProxies`] member. For each
//!    header only the first entry of a comma-separated list is read, and it
//!    is used only if it parses as an IP address (an optional port is
//!    stripped). A header carrying garbage falls through to the next one.
//! 2. The transport peer address from axum's `ConnectInfo<SocketAddr>`.
//! 3. [`UNKNOWN_IP`].
//!
//! IPv6-mapped IPv4 addresses (`::ffff:a.b.c.d`) are reported in their IPv4
//! form.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! **Headers are client-controlled.** A peer outside `TRUSTED_PROXIES` that
//! sends `X-Forwarded-For: 127.0.0.1` is identified by its own address, so it
//! can neither borrow a trusted identity nor rotate rate-limit keys. The
//! proxies that are trusted must overwrite (not append to) the headers:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! A service run without `ConnectInfo` cannot see its peer and takes the
//! headers as given. The binary always serves with connect info.
//!
//! Requests with no resolvable address share the `"unknown"` key and are
//! collectively rate-limited.

use std::borrow::Cow;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use tracing::{debug, warn};

use crate::services::IpRange;

/// Fallback identifier when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Headers consulted for the client address, highest priority first.
pub const CLIENT_IP_HEADERS: [&str; 7] = [
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
    "true-client-ip",
    "x-client-ip",
    "x-cluster-client-ip",
    "forwarded-for",
];

/// Default `TRUSTED_PROXIES`: a reverse proxy on the same host.
pub const DEFAULT_TRUSTED_PROXIES: &str = "127.0.0.0/8,::1";

/// Peers whose forwarded-address headers are believed.
///
/// IPv4 entries may be CIDR ranges; IPv6 entries are literal addresses.
/// Empty means no peer is a proxy and headers are never read.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    ranges: Vec<IpRange>,
    addrs: HashSet<IpAddr>,
}

impl TrustedProxies {
    /// Parse entries, logging and skipping malformed ones.
    pub fn new(entries: &[String]) -> Self {
        let mut proxies = Self::default();
        for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            if let Ok(range) = IpRange::parse(entry) {
                proxies.ranges.push(range);
            } else if let Ok(addr) = entry.parse::<Ipv6Addr>() {
                proxies.addrs.insert(IpAddr::V6(addr).to_canonical());
            } else {
                warn!(entry, "Invalid entry in TRUSTED_PROXIES, skipping");
            }
        }
        if !proxies.is_empty() {
            debug!(
                ranges = proxies.ranges.len(),
                addrs = proxies.addrs.len(),
                "Trusted proxy validation enabled"
            );
        }
        proxies
    }

    /// Parse a comma-separated list.
    pub fn parse(list: &str) -> Self {
        let entries: Vec<String> = list.split(',').map(str::to_string).collect();
        Self::new(&entries)
    }

    /// Loopback only.
    pub fn loopback() -> Self {
        Self::parse(DEFAULT_TRUSTED_PROXIES)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.addrs.is_empty()
    }

    pub fn contains(&self, peer: IpAddr) -> bool {
        match peer.to_canonical() {
            IpAddr::V4(v4) => self.ranges.iter().any(|r| r.contains(v4)),
            v6 => self.addrs.contains(&v6),
        }
    }
}

/// Client address resolved once by the trust gate and handed to inner
/// layers through the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Where a resolved address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSource {
    Header(&'static str),
    Peer,
    Unknown,
}

/// Parse one candidate address. Accepts a bare IP or `ip:port` /
/// `[v6]:port`, and unwraps IPv6-mapped IPv4.
#[inline]
pub fn parse_client_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let ip = raw
        .parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))?;
    Some(ip.to_canonical())
}

/// First valid address in the proxy headers, with the header it came from.
pub fn ip_from_headers(headers: &HeaderMap) -> Option<(&'static str, IpAddr)> {
    CLIENT_IP_HEADERS.iter().find_map(|&name| {
        let value = headers.get(name)?.to_str().ok()?;
        let first = value.split(',').next()?;
        match parse_client_ip(first) {
            Some(ip) => Some((name, ip)),
            None => {
                debug!(header = name, value = %value, "Ignoring unparsable client IP header");
                None
            }
        }
    })
}

fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip().to_canonical())
}

/// Resolve the client address together with its source.
pub fn resolve_client_ip<B>(
    req: &Request<B>,
    proxies: &TrustedProxies,
) -> (Cow<'static, str>, IpSource) {
    let peer = peer_ip(req);
    let headers_believed = peer.is_none_or(|p| proxies.contains(p));

    if headers_believed {
        if let Some((header, ip)) = ip_from_headers(req.headers()) {
            return (Cow::Owned(ip.to_string()), IpSource::Header(header));
        }
    } else if let Some(peer) = peer
        && let Some((header, claimed)) = ip_from_headers(req.headers())
    {
        debug!(
            peer = %peer,
            header,
            claimed = %claimed,
            "Ignoring forwarded address from untrusted peer"
        );
    }

    match peer {
        Some(peer) => (Cow::Owned(peer.to_string()), IpSource::Peer),
        None => (Cow::Borrowed(UNKNOWN_IP), IpSource::Unknown),
    }
}

/// Resolve the client address used as the rate-limit identifier.
///
/// Returns `Cow::Borrowed(UNKNOWN_IP)` when nothing resolves, so the fallback
/// costs no allocation.
#[inline]
pub fn extract_client_ip<B>(req: &Request<B>, proxies: &TrustedProxies) -> Cow<'static, str> {
    resolve_client_ip(req, proxies).0
}

/// The address the trust gate settled on, or, for requests that never
/// crossed it, one resolved with no trusted proxies.
pub fn client_ip_of<B>(req: &Request<B>) -> Cow<'static, str> {
    match req.extensions().get::<ClientIp>() {
        Some(ClientIp(ip)) => Cow::Owned(ip.clone()),
        None => extract_client_ip(req, &TrustedProxies::default()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn none() -> TrustedProxies {
        TrustedProxies::default()
    }

    fn with_peer(mut req: Request<Body>, peer: [u8; 4]) -> Request<Body> {
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 51000))));
        req
    }

    fn request(headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_first_entry_of_forwarded_for() {
        let req = request(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1, 10.0.0.2")]);
        assert_eq!(extract_client_ip(&req, &none()), "203.0.113.7");
        assert_eq!(
            resolve_client_ip(&req, &none()).1,
            IpSource::Header("x-forwarded-for")
        );
    }

    #[test]
    fn test_header_priority() {
        let req = request(&[
            ("x-client-ip", "198.51.100.4"),
            ("cf-connecting-ip", "198.51.100.3"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(extract_client_ip(&req, &none()), "198.51.100.2");

        let req = request(&[
            ("forwarded-for", "198.51.100.9"),
            ("true-client-ip", "198.51.100.5"),
        ]);
        assert_eq!(extract_client_ip(&req, &none()), "198.51.100.5");
    }

    #[test]
    fn test_invalid_header_falls_through() {
        let req = request(&[
            ("x-forwarded-for", "not-an-ip"),
            ("x-real-ip", "192.0.2.10"),
        ]);
        assert_eq!(extract_client_ip(&req, &none()), "192.0.2.10");
    }

    #[test]
    fn test_empty_and_whitespace_headers_ignored() {
        let req = request(&[("x-forwarded-for", ""), ("x-real-ip", "   ")]);
        assert_eq!(extract_client_ip(&req, &none()), UNKNOWN_IP);
    }

    #[test]
    fn test_mapped_ipv4_is_unwrapped() {
        let req = request(&[("x-forwarded-for", "::ffff:192.0.2.1")]);
        assert_eq!(extract_client_ip(&req, &none()), "192.0.2.1");
    }

    #[test]
    fn test_ipv6_and_ports() {
        let req = request(&[("x-forwarded-for", "2001:db8::1")]);
        assert_eq!(extract_client_ip(&req, &none()), "2001:db8::1");

        let req = request(&[("x-forwarded-for", "192.0.2.1:8080")]);
        assert_eq!(extract_client_ip(&req, &none()), "192.0.2.1");

        let req = request(&[("x-real-ip", "[2001:db8::2]:443")]);
        assert_eq!(extract_client_ip(&req, &none()), "2001:db8::2");
    }

    #[test]
    fn test_peer_address_fallback() {
        let req = with_peer(request(&[]), [192, 0, 2, 77]);
        assert_eq!(extract_client_ip(&req, &none()), "192.0.2.77");
        assert_eq!(resolve_client_ip(&req, &none()).1, IpSource::Peer);
    }

    #[test]
    fn test_header_from_trusted_proxy_wins_over_peer() {
        let req = with_peer(request(&[("x-real-ip", "192.0.2.5")]), [127, 0, 0, 1]);
        assert_eq!(
            resolve_client_ip(&req, &TrustedProxies::loopback()),
            (Cow::Owned("192.0.2.5".to_string()), IpSource::Header("x-real-ip"))
        );
    }

    #[test]
    fn test_spoofed_loopback_from_untrusted_peer_is_ignored() {
        let req = with_peer(
            request(&[("x-forwarded-for", "127.0.0.1")]),
            [203, 0, 113, 99],
        );
        let (ip, source) = resolve_client_ip(&req, &TrustedProxies::loopback());
        assert_eq!(ip, "203.0.113.99");
        assert_eq!(source, IpSource::Peer);
    }

    #[test]
    fn test_empty_proxy_list_never_reads_headers() {
        let req = with_peer(request(&[("x-real-ip", "192.0.2.5")]), [127, 0, 0, 1]);
        assert_eq!(extract_client_ip(&req, &none()), "127.0.0.1");
    }

    #[test]
    fn test_trusted_proxies_parsing() {
        let proxies = TrustedProxies::parse("10.0.0.0/8, ::1, bogus, 192.0.2.7");
        assert!(proxies.contains(IpAddr::from([10, 200, 3, 4])));
        assert!(proxies.contains(IpAddr::from([192, 0, 2, 7])));
        assert!(!proxies.contains(IpAddr::from([192, 0, 2, 8])));
        assert!(proxies.contains(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(proxies.contains("::ffff:10.1.1.1".parse().unwrap()));
        assert!(!proxies.contains("2001:db8::1".parse().unwrap()));
        assert!(TrustedProxies::parse(" , ").is_empty());
    }

    #[test]
    fn test_gate_resolved_ip_is_preferred() {
        let mut req = with_peer(request(&[("x-real-ip", "192.0.2.5")]), [203, 0, 113, 4]);
        assert_eq!(client_ip_of(&req), "203.0.113.4");
        req.extensions_mut().insert(ClientIp("198.51.100.1".to_string()));
        assert_eq!(client_ip_of(&req), "198.51.100.1");
    }

    #[test]
    fn test_unknown_is_borrowed() {
        let req = request(&[]);
        let ip = extract_client_ip(&req, &none());
        assert!(matches!(ip, Cow::Borrowed(UNKNOWN_IP)));
    }

    #[test]
    fn test_non_utf8_header_is_skipped() {
        let mut req = request(&[("x-real-ip", "192.0.2.8")]);
        req.headers_mut().insert(
            "x-forwarded-for",
            axum::http::HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap(),
        );
        assert_eq!(extract_client_ip(&req, &none()), "192.0.2.8");
    }
}
