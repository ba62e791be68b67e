// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Filesystem-safe job names
//!
//! Job names become directory names under `.gitlab-ci-local/`, docker
//! volume names and log file names, so anything outside `[A-Za-z0-9_-]`
//! has to be rewritten. Disallowed characters are replaced by the
//! Crockford base-32 encoding of their UTF-16 code units, fixed at four
//! digits per unit so the mapping stays 1:1.

/// Crockford base-32 alphabet (no I, L, O, U)
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Rewrite `name` so it only contains `[A-Za-z0-9_-]`.
pub fn safe_job_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                push_base32(&mut out, *unit);
            }
        }
    }

    out
}

/// Encode one 16-bit unit as four Crockford digits, most significant first.
fn push_base32(out: &mut String, unit: u16) {
    let value = unit as u32;
    for shift in [15u32, 10, 5, 0] {
        let digit = ((value >> shift) & 0x1f) as usize;
        out.push(ALPHABET[digit] as char);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_plain_names_pass_through() {
        assert_eq!(safe_job_name("build-job_1"), "build-job_1");
    }

    #[test]
    fn test_output_charset() {
        for name in ["deploy prod", "lint/rust", "test:unit", "smoke 🚀"] {
            let safe = safe_job_name(name);
            assert!(
                safe.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
                "unsafe char survived in {safe:?}"
            );
        }
    }

    #[test]
    fn test_colon_encoding_is_stable() {
        // ':' is U+003A
        assert_eq!(safe_job_name("a:b"), format!("a{}b", encoded(':')));
    }

    #[test]
    fn test_distinct_inputs_stay_distinct() {
        let inputs = [
            "build", "build ", " build", "bu ild", "bu:ild", "bu/ild", "bu.ild", "bü1d", "bu\tild",
        ];
        let outputs: HashSet<String> = inputs.iter().map(|n| safe_job_name(n)).collect();
        assert_eq!(outputs.len(), inputs.len());
    }

    #[test]
    fn test_surrogate_pairs_encode_both_units() {
        // '🚀' needs two UTF-16 units, so eight digits
        let safe = safe_job_name("🚀");
        assert_eq!(safe.len(), 8);
    }

    fn encoded(c: char) -> String {
        let mut s = String::new();
        push_base32(&mut s, c as u16);
        s
    }
}
