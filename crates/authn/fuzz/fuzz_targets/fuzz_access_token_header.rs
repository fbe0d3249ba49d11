//! Fuzz target for header checks that run before any key lookup.
//!
//! Decodes the JWT header of arbitrary strings and runs the algorithm and
//! `kid` validators on whatever comes out. None of it may panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tollgate_authn::validation::{validate_algorithm, validate_kid};

fuzz_target!(|data: &[u8]| {
    let Ok(token) = std::str::from_utf8(data) else {
        return;
    };

    let _ = validate_algorithm(token);
    let _ = validate_kid(token);

    if let Ok(header) = jsonwebtoken::decode_header(token) {
        let _ = validate_algorithm(&format!("{:?}", header.alg));
        if let Some(kid) = header.kid {
            let _ = validate_kid(&kid);
        }
    }
});
