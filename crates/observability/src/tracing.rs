//! Tracing/logging initialization.
//!
//! JSON lines by default; `LOG_FORMAT=pretty` switches to human-readable output
//! for local runs. Filtering follows `RUST_LOG` (default `info`).

use tracing_subscriber::EnvFilter;

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Read `LOG_FORMAT`; anything other than `pretty` means JSON.
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("pretty") => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(service: &'static str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match LogFormat::from_env() {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init()
            .is_ok(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(false)
            .try_init()
            .is_ok(),
    };

    if installed {
        ::tracing::info!(service, "tracing initialized");
    }
}
