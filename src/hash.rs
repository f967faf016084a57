use sha2::{Digest, Sha256};

/// Trim, lowercase and SHA-256 a raw value, returning lowercase hex.
///
/// Casing and surrounding whitespace never change the digest, so the same
/// logical identifier always matches on the receiving side.
pub fn normalize_and_hash(raw: &str) -> String {
    let normalized = raw.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}
