//! Tracing/logging initialization.
//!
//! Filtering follows `RUST_LOG` when set; otherwise the caller's default
//! directive applies. `DOCREDUCE_LOG_FORMAT=pretty` switches from JSON lines
//! to human-readable output.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    /// Read `DOCREDUCE_LOG_FORMAT`; anything other than `pretty` means JSON.
    pub fn from_env() -> Self {
        match std::env::var("DOCREDUCE_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let _ = init_with(LogFormat::from_env(), DEFAULT_FILTER);
}

/// Initialize with an explicit format and fallback filter.
///
/// Fails if `default_filter` is not a valid directive or a global subscriber
/// is already installed.
pub fn init_with(format: LogFormat, default_filter: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid log filter '{default_filter}'"))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    match format {
        LogFormat::Json => builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))
            .context("failed to install tracing subscriber"),
        LogFormat::Pretty => builder
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))
            .context("failed to install tracing subscriber"),
    }
}
