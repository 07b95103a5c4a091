//! Content fingerprinting for duplicate detection.
//!
//! Two uploads are considered the same document when their *content* matches,
//! regardless of filename or incidental whitespace. The fingerprint is a
//! SHA-256 hex digest over a normalized rendering of the text.

use sha2::{Digest, Sha256};

/// Compute the content fingerprint: lowercase the text, collapse all runs of
/// whitespace to single spaces, trim, then SHA-256 the result.
pub fn content_fingerprint(text: &str) -> String {
    let normalized = normalize_for_fingerprint(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize_for_fingerprint(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_content_same_fingerprint() {
        assert_eq!(
            content_fingerprint("Hello World"),
            content_fingerprint("Hello World")
        );
    }

    #[test]
    fn test_case_and_whitespace_insensitive() {
        assert_eq!(
            content_fingerprint("Hello   World\n\n"),
            content_fingerprint("hello world")
        );
    }

    #[test]
    fn test_different_content_different_fingerprint() {
        assert_ne!(
            content_fingerprint("alpha document"),
            content_fingerprint("beta document")
        );
    }

    #[test]
    fn test_hex_digest_shape() {
        let fp = content_fingerprint("anything");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
