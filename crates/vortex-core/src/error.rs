//! Error types for configuration loading and validation.

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating the watchdog configuration.
///
/// These are the only fatal errors in the system: they stop the daemon
/// before any tunnel is supervised.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for `{key}`: {value:?}")]
    Duration { key: &'static str, value: String },

    #[error("invalid watchdog setting `{key}`: {reason}")]
    Watchdog { key: &'static str, reason: String },

    #[error("invalid tunnel `{tunnel}`: {reason}")]
    Tunnel { tunnel: String, reason: String },
}
