//! Provider side of assembly: capability registry, verification gate, cell control.
//!
//! `RegistryClient` asks configured providers for a cell satisfying one
//! capability, `SignatureGate` decides whether a delivered cell is trusted,
//! and `CellControl` is the fixed control-plane method set every cell
//! implementation answers (`initialize` through `release`).

pub mod control;
pub mod protocol;
pub mod registry;
pub mod verify;

pub use control::{CellBinder, CellControl, Handshake, HandshakeRole, HttpCellBinder, HttpCellControl};
pub use protocol::*;
pub use registry::{Candidate, CapabilityProvider, HttpProvider, RegistryClient, RequestHint};
pub use verify::{SignatureGate, Verifier};
