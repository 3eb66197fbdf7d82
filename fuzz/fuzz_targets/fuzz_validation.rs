//! Fuzz testing for request validation and quota parsing.
//!
//! Every function here takes untrusted input (query strings, bodies, and
//! environment variables) and must never panic.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_validation -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use ratewrap::Quota;
use ratewrap::validation::validate_name;
use ratewrap::validators::{parse_bool, validate_uuid};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    let _ = validate_name("name", s);
    let _ = validate_uuid("id", s);
    let _ = parse_bool(s);

    // A quota that parses must print back to an equal quota
    if let Ok(quota) = s.parse::<Quota>() {
        assert!(quota.tokens() > 0 && quota.window_secs() > 0);
        let reparsed: Quota = quota.to_string().parse().expect("Display output must parse");
        assert_eq!(quota, reparsed);
    }
});
