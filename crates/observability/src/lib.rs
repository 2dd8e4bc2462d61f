//! Tracing/logging setup shared by the worker binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize process-wide logging with JSON output at `info`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize logging with an explicit default level and format.
///
/// `RUST_LOG`, when set, still takes precedence over `level`.
pub fn init_with(level: &str, format: LogFormat) {
    tracing::init_with(level, format);
}
