//! Collaborators the event loop drives
//!
//! The loop decides *when* things happen; these traits are *what* happens.
//! Implementations live elsewhere (`crate::git`, `crate::sync`) or in tests.

use super::revision::Commit;
use super::sync_tag::SyncTagTracker;
use crate::Result;
use async_trait::async_trait;
use std::time::Instant;

/// The mirrored configuration repository
///
/// Refreshed notifications are delivered separately, as the
/// `mpsc::Receiver<()>` handed to the loop.
#[async_trait]
pub trait Repo: Send + Sync {
    /// Upstream URL, for log lines
    fn origin_url(&self) -> String;

    /// Fetch from upstream now
    async fn refresh(&self) -> Result<()>;

    /// Revision at the tip of `branch`
    async fn branch_head(&self, branch: &str) -> Result<String>;

    /// Verify `tag` and return the revision it points at
    ///
    /// `Ok(None)` when the tag does not exist yet, as before the first sync.
    async fn verify_tag(&self, tag: &str) -> Result<Option<String>>;

    /// Commits after `from` up to and including `to`, newest first,
    /// limited to those touching `paths` when it is non-empty
    async fn commits_between(&self, from: &str, to: &str, paths: &[String]) -> Result<Vec<Commit>>;
}

/// Builds sync attempts
#[async_trait]
pub trait SyncRunner: Send + Sync {
    /// Prepare an attempt to sync toward `head` (empty if not yet known)
    async fn new_sync(&self, head: &str) -> Result<Box<dyn SyncAttempt>>;
}

/// One reconciliation attempt
#[async_trait]
pub trait SyncAttempt: Send {
    /// When the attempt was created, for the duration metric
    fn started(&self) -> Instant;

    /// Apply desired state and move the sync tag, reporting the move to `tag`
    async fn run(&mut self, tag: &mut SyncTagTracker) -> Result<()>;
}

/// Looks for newer images of running workloads
///
/// Fire and forget: implementations log their own errors.
#[async_trait]
pub trait ImagePoller: Send + Sync {
    async fn poll_for_new_images(&self);
}

/// Image poller for deployments without a registry to watch
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopImagePoller;

#[async_trait]
impl ImagePoller for NoopImagePoller {
    async fn poll_for_new_images(&self) {
        tracing::debug!("Image polling disabled");
    }
}
