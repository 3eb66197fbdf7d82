//! Fuzz the client address parser with arbitrary forwarded header values.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_client_addr
//! ```

#![no_main]

use std::net::IpAddr;

use libfuzzer_sys::fuzz_target;
use ratewrap::middleware::ip::{CidrRange, parse_client_addr};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    if let Some(ip) = parse_client_addr(s) {
        // Whatever parses must round-trip through its canonical form
        assert_eq!(parse_client_addr(&ip.to_string()), Some(ip));
    }

    if let Some(range) = CidrRange::parse(s) {
        let _ = range.contains(&IpAddr::from([127, 0, 0, 1]));
        let _ = range.contains(&IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1]));
    }
});
