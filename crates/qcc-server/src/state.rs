//! Shared application state.

use qcc_core::QccConfig;
use qcc_runtime::Assembler;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: QccConfig,
    pub assembler: Assembler,
}

impl AppState {
    pub fn new(config: QccConfig, assembler: Assembler) -> Self {
        Self { config, assembler }
    }
}
