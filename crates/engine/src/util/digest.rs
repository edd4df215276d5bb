use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest as _, Sha256};

static SAFE_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Za-z_-]+$").unwrap());

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn is_safe_key(key: &str) -> bool {
    SAFE_KEY.is_match(key)
}

/// Maps an arbitrary cache key onto a name usable as a single filesystem entry.
pub fn sanitize_key(key: &str) -> String {
    if is_safe_key(key) {
        key.to_string()
    } else {
        sha256_hex(key.as_bytes())
    }
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
