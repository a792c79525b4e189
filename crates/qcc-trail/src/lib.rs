//! Quantum trail: the append-only ledger of past assemblies.
//!
//! The assembler queries it before requesting cells (`find_similar`) and
//! writes to it after activation and release. Ledger failures never fail an
//! assembly; callers log and move on.

pub mod client;
pub mod ledger;
pub mod signature;
pub mod similarity;
pub mod types;

pub use client::{HttpTrailClient, TrailClient};
pub use ledger::InMemoryTrail;
pub use signature::generate_signature;
pub use types::*;
