//! Process-wide logging setup shared by the courier binaries.

pub mod tracing;

pub use crate::tracing::{LogConfig, LogConfigError, LogFormat};

/// Initialize process-wide tracing/logging.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init(config: &LogConfig) {
    tracing::init(config);
}
