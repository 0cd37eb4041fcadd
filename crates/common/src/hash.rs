// Content hashing for change detection.
//
// Local, remote, and base copies are compared by SHA-256 of their UTF-8 bytes.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 hash of file content.
pub type ContentHash = String;

/// Compute the SHA-256 hash of the given bytes, returned as a lowercase hex string.
pub fn sha256_hex(content: &[u8]) -> ContentHash {
    let digest = Sha256::digest(content);
    let mut s = String::with_capacity(digest.len() * 2);
    for byte in digest {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}

/// Hash of a text file's content.
pub fn content_hash(content: &str) -> ContentHash {
    sha256_hex(content.as_bytes())
}
