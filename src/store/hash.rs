//! Content fingerprints.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 over the JSON serialization of `value`, as lowercase hex.
///
/// Used to fingerprint table schemas so a reload with no structural change
/// can be recognized without a column-by-column diff.
pub fn compute_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
