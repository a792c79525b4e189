//! QCC Core: data model, error taxonomy, configuration, device resources.
//!
//! Everything the assembly pipeline passes between crates lives here:
//! capability requirements, cell instances, solutions, connections and
//! resource budgets, plus the single typed error every stage surfaces.

pub mod config;
pub mod device;
pub mod error;
pub mod resources;
pub mod types;

pub use config::{AssemblyPolicy, QccConfig, TimeoutConfig};
pub use device::DeviceResources;
pub use error::{Error, ErrorKind, Result};
pub use resources::ResourceBudget;
pub use types::*;
