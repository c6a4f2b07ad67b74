//! 64-bit simhash fingerprints for near-duplicate detection.
//!
//! Each distinct canonical token is hashed to 32 bits with a `h * 31 + c`
//! rolling hash over UTF-16 code units. Signature position `i` tests hash bit
//! `i % 32`, so the upper half of the signature mirrors the lower half; the
//! effective resolution is 32 bits spread over 64. Position 0 is the most
//! significant bit of the stored hex string. Stored fingerprints depend on
//! this exact layout.

use std::collections::BTreeSet;

/// Signatures within this many differing bits are duplicates.
pub const DEFAULT_MAX_DISTANCE: u32 = 3;

fn token_hash(token: &str) -> i32 {
    token
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_shl(5).wrapping_sub(h).wrapping_add(unit as i32))
}

/// Fingerprint a set of canonical tokens.
pub fn simhash_tokens(tokens: &BTreeSet<String>) -> u64 {
    let hashes: Vec<u32> = tokens.iter().map(|t| token_hash(t) as u32).collect();
    let mut signature = 0u64;
    for i in 0..64 {
        let bit = 1u32 << (i % 32);
        let counter: i64 = hashes
            .iter()
            .map(|h| if h & bit != 0 { 1 } else { -1 })
            .sum();
        if counter > 0 {
            signature |= 1u64 << (63 - i);
        }
    }
    signature
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

pub fn is_near_duplicate(a: u64, b: u64, max_distance: u32) -> bool {
    hamming_distance(a, b) <= max_distance
}

/// Storage form: 16 lowercase hex digits.
pub fn to_hex(signature: u64) -> String {
    format!("{signature:016x}")
}

pub fn from_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s, 16).ok()
}
