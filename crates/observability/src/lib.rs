//! Process-wide tracing setup for job vault binaries and tests.

/// Initialize process-wide tracing with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogFormat::default());
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use tracing::LogFormat;
