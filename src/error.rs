//! Crate-level error type.
//!
//! Only construction-time paths (config loading, instance init, daemon
//! composition) surface a [`TuneError`]. Per-device runtime operations log
//! their failure and degrade to `None` / `false` instead.

use std::path::PathBuf;

/// Errors produced while building or configuring the tuning engine.
#[derive(Debug, thiserror::Error)]
pub enum TuneError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML or has the wrong shape.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The configuration parsed but failed validation.
    #[error("invalid config: {0}")]
    Config(String),

    /// An instance names a plugin that is not registered.
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    /// Power-mode / spindown tables are empty or of different lengths.
    #[error("invalid level tables: {0}")]
    InvalidLevels(String),

    /// A device selector or sysfs option key is not a valid glob.
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// A sysfs attribute could not be read or written.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A write target resolved outside the sanctioned sysfs root.
    #[error("refusing to write '{path}': not inside {root}")]
    OutsideSysfs { path: PathBuf, root: PathBuf },
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, TuneError>;
