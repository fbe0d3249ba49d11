//! Fuzz target for `jti` sniffing.
//!
//! Arbitrary strings go through the sniffer at a small and the default size
//! limit. Every result must be `Ok(jti)` or `Err(AuthError)`; a non-empty
//! `jti` is the only accepted output.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tollgate_authn::{JtiSniffer, bearer_token};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    for limit in [64, 4_096] {
        let sniffer = JtiSniffer::new(limit);
        if let Ok(jti) = sniffer.extract(input) {
            assert!(!jti.is_empty());
            assert!(jti.len() <= limit);
        }
        let _ = sniffer.correlation_key(input);
    }

    if let Some(token) = bearer_token(input) {
        let _ = JtiSniffer::new(4_096).extract(token);
    }
});
