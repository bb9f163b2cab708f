//! Configuration validation
//!
//! Checks a [`DaemonConfig`] before the event loop starts:
//! - Intervals and timeouts are non-zero
//! - The repository URL looks like something git can clone
//! - Branch and sync tag are usable ref names

use super::daemon_config::DaemonConfig;
use crate::ReconcilerError;
use std::time::Duration;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a daemon configuration
pub fn validate_config(config: &DaemonConfig) -> ValidationResult {
    let mut errors = Vec::new();

    let durations = [
        ("loop.sync_interval_secs", config.event_loop.sync_interval),
        ("loop.poll_interval_secs", config.event_loop.poll_interval),
        ("git.timeout_secs", config.git.timeout),
        ("git.refresh_interval_secs", config.git.refresh_interval),
    ];
    for (field, value) in durations {
        if value == Duration::ZERO {
            errors.push(ValidationError::new(field, "Must be greater than 0"));
        }
    }

    if !is_valid_git_url(&config.git.url) {
        errors.push(ValidationError::new(
            "git.url",
            format!("Invalid Git URL format: {}", config.git.url),
        ));
    }

    if let Some(message) = ref_name_problem(&config.git.branch) {
        errors.push(ValidationError::new("git.branch", message));
    }

    if let Some(message) = ref_name_problem(&config.git.sync_tag) {
        errors.push(ValidationError::new("git.sync_tag", message));
    }

    if config.server.listen.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "server.listen",
            format!("Invalid listen address: {}", config.server.listen),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check that a branch or tag name is usable
fn ref_name_problem(name: &str) -> Option<String> {
    if name.is_empty() {
        return Some("Cannot be empty".to_string());
    }
    if name.contains(char::is_whitespace) || name.contains("..") || name.starts_with('-') {
        return Some(format!("Invalid ref name: {}", name));
    }
    None
}

/// Check if a URL is a valid Git URL
fn is_valid_git_url(url: &str) -> bool {
    // SSH format: git@github.com:user/repo.git
    if url.starts_with("git@") && url.contains(':') {
        return true;
    }

    if url.starts_with("https://")
        || url.starts_with("http://")
        || url.starts_with("ssh://")
        || url.starts_with("file://")
    {
        return true;
    }

    // Local path, handy for tests and single-node setups
    url.starts_with('/')
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &DaemonConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        ReconcilerError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}
