//! Fuzz testing for the parsers that see untrusted or operator input.
//!
//! Client IP headers, `Authorization` headers, `TRUSTED_IP_RANGES` entries
//! and admin payload fields must never panic, whatever bytes they carry.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_input_parsers -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use trust_gate::middleware::ip::parse_client_ip;
use trust_gate::middleware::parse_bearer;
use trust_gate::services::IpRange;
use trust_gate::services::trusted_ips::{canonical_ip, normalize_ip, parse_ranges};
use trust_gate::validation::{validate_endpoint_patterns, validate_ip_address};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    // CIDR parsing: a parsed range always contains its own network address
    if let Ok(range) = IpRange::parse(s) {
        assert!(range.start <= range.end);
        assert!(range.contains(std::net::Ipv4Addr::from(range.start)));
    }
    let _ = parse_ranges(s);

    // IP normalisation
    let normalized = normalize_ip(s);
    assert!(!normalized.contains(','));
    let _ = canonical_ip(s);
    let _ = parse_client_ip(s);
    let _ = validate_ip_address(s);

    // Bearer header parsing: an accepted token is non-empty
    if let Ok(token) = parse_bearer(Some(s)) {
        assert!(!token.is_empty());
    }

    let _ = validate_endpoint_patterns(&[s.to_string()]);
});
