//! Quantum signature generation.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Anonymous signature correlating one assembly session.
///
/// `qc` + hex(SHA-256(SHA-256(user id), nonce, sorted capabilities, timestamp)).
/// The user id is hashed before mixing so it cannot be recovered from the
/// ledger.
pub fn generate_signature<S: AsRef<str>>(user_id: &str, capabilities: &[S], now: DateTime<Utc>) -> String {
    let user_hash = Sha256::digest(user_id.as_bytes());
    let nonce = uuid::Uuid::new_v4();

    let mut caps: Vec<&str> = capabilities.iter().map(|c| c.as_ref()).collect();
    caps.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(user_hash);
    hasher.update(nonce.as_bytes());
    hasher.update(caps.join(",").as_bytes());
    hasher.update(now.timestamp_millis().to_be_bytes());
    format!("qc{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_shape_and_uniqueness() {
        let now = Utc::now();
        let a = generate_signature("user-1", &["file_operations", "user_interface"], now);
        let b = generate_signature("user-1", &["file_operations", "user_interface"], now);
        assert!(a.starts_with("qc"));
        assert_eq!(a.len(), 66);
        assert!(!a.contains("user-1"));
        assert_ne!(a, b);
    }
}
