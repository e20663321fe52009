//! vortex-core: shared types and configuration for the VortexL2 watchdog.
//!
//! Holds the `config.toml` model, resolution of role-based tunnel
//! settings into concrete [`TunnelSpec`]s, and the value types exchanged
//! between the health subsystem and its consumers (probe results,
//! remediation records, status snapshots).

pub mod config;
pub mod error;
pub mod types;

pub use config::{VortexConfig, WatchdogSettings};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
