//! Verification gate: a delivered cell must pass before it is instantiated.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use qcc_core::{Error, Result, SecurityLevel};
use tracing::{debug, warn};

use crate::protocol::SIGNATURE_PREFIX;
use crate::registry::Candidate;

/// Checks a candidate cell's integrity at a requested security level.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, candidate: &Candidate, level: SecurityLevel) -> Result<()>;
}

type CacheKey = (String, String, String, SecurityLevel);

/// Verdicts kept by default; least recently used are dropped first.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Signature-based gate with a per-provider trust list.
///
/// Outcomes are cached per provider, cell, signature and level, so a
/// repeated delivery of the same cell is not re-hashed.
pub struct SignatureGate {
    trusted: HashSet<String>,
    cache: Mutex<LruCache<CacheKey, std::result::Result<(), String>>>,
}

impl SignatureGate {
    pub fn new(trusted: impl IntoIterator<Item = String>) -> Self {
        Self::with_capacity(trusted, DEFAULT_CACHE_CAPACITY)
    }

    /// Gate caching at most `capacity` verdicts (at least one).
    pub fn with_capacity(trusted: impl IntoIterator<Item = String>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            trusted: trusted.into_iter().collect(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn is_trusted(&self, provider: &str) -> bool {
        self.trusted.contains(provider)
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    fn check(&self, candidate: &Candidate, level: SecurityLevel) -> std::result::Result<(), String> {
        let cell = &candidate.descriptor;
        let sig = cell.signature.as_str();

        if !sig.starts_with(SIGNATURE_PREFIX) || sig.len() != SIGNATURE_PREFIX.len() + 64 {
            return Err("malformed signature".into());
        }
        if sig != cell.expected_signature() {
            return Err("signature does not match cell content".into());
        }
        if level >= SecurityLevel::High && !self.is_trusted(&candidate.provider) {
            return Err(format!("provider {} is not trusted at {} level", candidate.provider, level));
        }
        if level == SecurityLevel::Maximum && !cell.download_url.starts_with("https://") {
            return Err("maximum security requires an https download url".into());
        }
        Ok(())
    }
}

#[async_trait]
impl Verifier for SignatureGate {
    async fn verify(&self, candidate: &Candidate, level: SecurityLevel) -> Result<()> {
        let key = (
            candidate.provider.clone(),
            candidate.descriptor.cell_id.clone(),
            candidate.descriptor.signature.clone(),
            level,
        );

        let cached = self.cache.lock().get(&key).cloned();
        let outcome = match cached {
            Some(outcome) => {
                debug!("Verification cache hit for {}", candidate.descriptor.cell_id);
                outcome
            }
            None => {
                let outcome = self.check(candidate, level);
                self.cache.lock().put(key, outcome.clone());
                outcome
            }
        };

        outcome.map_err(|reason| {
            warn!(
                "Cell {} from {} failed verification: {}",
                candidate.descriptor.cell_id, candidate.provider, reason
            );
            Error::VerificationFailed {
                capability: candidate.capability.clone(),
                cell_id: candidate.descriptor.cell_id.clone(),
                reason,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CellDescriptor;

    fn candidate(provider: &str, url: &str) -> Candidate {
        Candidate {
            capability: "file_operations".into(),
            provider: provider.into(),
            descriptor: CellDescriptor {
                cell_id: "fs".into(),
                signature: String::new(),
                download_url: url.into(),
                capabilities: vec!["file_operations".into()],
                dependencies: vec![],
                version: "1.0.0".into(),
                provider: provider.into(),
                resources: None,
                requires: vec![],
                provides: vec![],
                control_url: None,
            }
            .signed(),
        }
    }

    #[tokio::test]
    async fn test_standard_accepts_valid_signature() {
        let gate = SignatureGate::new(Vec::new());
        let c = candidate("p1", "http://p1/fs");
        gate.verify(&c, SecurityLevel::Standard).await.unwrap();
        gate.verify(&c, SecurityLevel::Standard).await.unwrap();
        assert_eq!(gate.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let gate = SignatureGate::with_capacity(Vec::new(), 2);
        for provider in ["p1", "p2", "p3"] {
            let c = candidate(provider, "http://cells/fs");
            gate.verify(&c, SecurityLevel::Standard).await.unwrap();
        }
        assert_eq!(gate.cached_entries(), 2);

        // Evicted verdicts are recomputed, not lost.
        gate.verify(&candidate("p1", "http://cells/fs"), SecurityLevel::Standard)
            .await
            .unwrap();
        assert_eq!(gate.cached_entries(), 2);
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let gate = SignatureGate::new(Vec::new());
        let mut c = candidate("p1", "http://p1/fs");
        c.descriptor.version = "9.9.9".into();
        let err = gate.verify(&c, SecurityLevel::Standard).await.unwrap_err();
        match err {
            Error::VerificationFailed { capability, cell_id, reason } => {
                assert_eq!(capability, "file_operations");
                assert_eq!(cell_id, "fs");
                assert!(reason.contains("does not match"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let mut c = candidate("p1", "http://p1/fs");
        c.descriptor.signature = "deadbeef".into();
        assert!(gate.verify(&c, SecurityLevel::Standard).await.is_err());
    }

    #[tokio::test]
    async fn test_levels_require_trust_and_https() {
        let gate = SignatureGate::new(vec!["trusted".to_string()]);

        let untrusted = candidate("other", "https://other/fs");
        assert!(gate.verify(&untrusted, SecurityLevel::High).await.is_err());

        let plain = candidate("trusted", "http://trusted/fs");
        gate.verify(&plain, SecurityLevel::High).await.unwrap();
        assert!(gate.verify(&plain, SecurityLevel::Maximum).await.is_err());

        let secure = candidate("trusted", "https://trusted/fs");
        gate.verify(&secure, SecurityLevel::Maximum).await.unwrap();
    }
}
