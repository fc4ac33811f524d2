use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

pub const API_KEY_HEADER: &str = "X-API-Key";
pub const API_MICROTIME_HEADER: &str = "X-API-Microtime";
pub const API_HASH_HEADER: &str = "X-API-Hash";

/// Request digest over path, timestamp and shared secret. The web UI
/// recomputes the same digest and rejects stale or mismatched requests.
pub fn signature(secret: &str, path: &str, microtime: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(microtime.as_bytes());
    hasher.update(secret.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

pub fn microtime_now() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .to_string()
}
