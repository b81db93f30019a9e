//! Content hashing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Returns the URL-safe base64 SHA-256 of `data`.
///
/// The result contains only `[A-Za-z0-9_-]`, so it can be embedded in an
/// object key.
pub fn content_hash(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_key_safe() {
        let h = content_hash(b"hello");
        assert_eq!(h, content_hash(b"hello"));
        assert_ne!(h, content_hash(b"hello!"));
        assert_eq!(h.len(), 43);
        assert!(h
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }
}
