//! Process-wide tracing/logging setup for worker and supervisor processes.

/// Initialize tracing with the default configuration (`RUST_LOG`, JSON output).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::default());
}

/// Initialize tracing with a fallback filter used when `RUST_LOG` is unset.
pub fn init_with_filter(filter: &str) {
    tracing::init(&tracing::LogConfig::default().with_filter(filter));
}

/// Tracing configuration and subscriber installation.
pub mod tracing;

pub use tracing::{LogConfig, LogFormat};
