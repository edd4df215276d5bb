pub mod digest;

pub use digest::{constant_time_eq, is_safe_key, sanitize_key, sha256_hex};
