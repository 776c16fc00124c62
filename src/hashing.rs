use sha2::{Digest, Sha256};
use std::path::Path;

/// Hex SHA-256 over the source name and destination path.
pub fn record_key(source: &str, destination: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(destination.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}
