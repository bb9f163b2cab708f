//! Configuration system
//!
//! Loads the daemon's YAML configuration:
//! - Event loop intervals (sync, image poll)
//! - The watched git repository, branch and sync tag
//! - Signature verification policy
//! - HTTP listen address

mod daemon_config;
pub mod validation;

pub use daemon_config::{
    DaemonConfig, GitConfig, LoopConfig, ServerConfig, DEFAULT_GIT_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DEFAULT_REFRESH_INTERVAL, DEFAULT_SYNC_INTERVAL,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
