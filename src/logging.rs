//! Logging setup.
//!
//! Installs a `tracing-subscriber` fmt subscriber writing to stderr. The
//! `RUST_LOG` environment variable, when set, overrides the level passed in.

use tracing_subscriber::EnvFilter;

/// Default filter when neither `RUST_LOG` nor `--log-level` is given.
pub const DEFAULT_LEVEL: &str = "info";

/// Build the filter: `RUST_LOG` wins, then `level`, then [`DEFAULT_LEVEL`].
pub fn filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or(DEFAULT_LEVEL)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init(level: Option<&str>) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
