//! Daemon configuration file handling
//!
//! Loads the reconciler's YAML configuration: loop intervals, the git
//! repository being watched, and the HTTP listen address.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval between periodic syncs (5 minutes)
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Default interval between image registry polls (5 minutes)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Default bound on a single git operation
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default interval between mirror refreshes
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Serialize a [`Duration`] as whole seconds
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Event loop tunables; fixed for the lifetime of a loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Sync at least this often, even without upstream changes
    #[serde(rename = "sync_interval_secs", with = "secs", default = "default_sync_interval")]
    pub sync_interval: Duration,

    /// Poll the image registry this often
    #[serde(rename = "poll_interval_secs", with = "secs", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

fn default_sync_interval() -> Duration {
    DEFAULT_SYNC_INTERVAL
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl LoopConfig {
    /// Create a loop config from two intervals
    pub fn new(sync_interval: Duration, poll_interval: Duration) -> Self {
        Self {
            sync_interval,
            poll_interval,
        }
    }
}

/// The configuration repository being watched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitConfig {
    /// Clone URL of the repository
    pub url: String,

    /// Branch holding the desired state
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Tag moved to mark the last synced revision
    #[serde(default = "default_sync_tag")]
    pub sync_tag: String,

    /// Local directory for the mirror
    #[serde(default = "default_mirror_path")]
    pub path: PathBuf,

    /// Sub-paths of the repository that matter; empty means all of it
    #[serde(default)]
    pub paths: Vec<String>,

    /// Bound on revision resolution and refresh
    #[serde(rename = "timeout_secs", with = "secs", default = "default_git_timeout")]
    pub timeout: Duration,

    /// How often the mirror fetches from upstream
    #[serde(
        rename = "refresh_interval_secs",
        with = "secs",
        default = "default_refresh_interval"
    )]
    pub refresh_interval: Duration,

    /// Only sync commits with valid signatures
    #[serde(default)]
    pub verify_signatures: bool,

    /// GPG key used to sign the sync tag
    ///
    /// Without one the tag is written unsigned, and verification checks the
    /// signature of the commit it points at instead of the tag's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,

    /// Name recorded on sync tags
    #[serde(default = "default_user_name")]
    pub user_name: String,

    /// Email recorded on sync tags
    #[serde(default = "default_user_email")]
    pub user_email: String,
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_sync_tag() -> String {
    "reconciler-sync".to_string()
}

fn default_mirror_path() -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("reconciler");
    path.push("mirror");
    path
}

fn default_git_timeout() -> Duration {
    DEFAULT_GIT_TIMEOUT
}

fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

fn default_user_name() -> String {
    "Reconciler".to_string()
}

fn default_user_email() -> String {
    "reconciler@localhost".to_string()
}

impl GitConfig {
    /// Create a git config for a repository URL with default settings
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: default_branch(),
            sync_tag: default_sync_tag(),
            path: default_mirror_path(),
            paths: Vec::new(),
            timeout: DEFAULT_GIT_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            verify_signatures: false,
            signing_key: None,
            user_name: default_user_name(),
            user_email: default_user_email(),
        }
    }

    /// Set the branch
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Set the sync tag
    pub fn with_sync_tag(mut self, tag: impl Into<String>) -> Self {
        self.sync_tag = tag.into();
        self
    }

    /// Set the mirror directory
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the git operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable signature verification
    pub fn with_verify_signatures(mut self, verify: bool) -> Self {
        self.verify_signatures = verify;
        self
    }

    /// Sign the sync tag with `key`
    pub fn with_signing_key(mut self, key: impl Into<String>) -> Self {
        self.signing_key = Some(key.into());
        self
    }
}

/// HTTP surface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address for /health, /metrics and the trigger API
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:3031".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Event loop intervals
    #[serde(rename = "loop", default)]
    pub event_loop: LoopConfig,

    /// Watched repository
    pub git: GitConfig,

    /// HTTP surface
    #[serde(default)]
    pub server: ServerConfig,
}

impl DaemonConfig {
    /// Create a configuration for a repository URL with default settings
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            event_loop: LoopConfig::default(),
            git: GitConfig::new(url),
            server: ServerConfig::default(),
        }
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::ReconcilerError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading reconciler configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            url = %config.git.url,
            branch = %config.git.branch,
            sync_interval_secs = config.event_loop.sync_interval.as_secs(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving reconciler configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/reconciler/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("reconciler");
        path.push("config.yaml");
        path
    }
}
