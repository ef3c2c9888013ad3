//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Output shape of the process log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFormat {
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    /// JSON lines when true, human readable otherwise.
    pub json: bool,
    /// Route output through the libtest capture writer.
    pub test_writer: bool,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json: true,
            test_writer: false,
        }
    }
}

impl LogFormat {
    /// Plain text output captured per test; `debug` for the job crates.
    pub fn for_tests() -> Self {
        Self {
            default_filter: "jobvault_infra=debug,sqlx=warn".to_string(),
            json: false,
            test_writer: true,
        }
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&format.default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(!format.json);

    // try_init fails once a global subscriber exists; that is the no-op case.
    let _ = match (format.json, format.test_writer) {
        (true, true) => builder.json().with_test_writer().try_init(),
        (true, false) => builder.json().try_init(),
        (false, true) => builder.with_test_writer().try_init(),
        (false, false) => builder.try_init(),
    };
}
