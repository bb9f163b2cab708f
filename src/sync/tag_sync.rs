//! Sync attempts that record their outcome on the sync tag
//!
//! An attempt applies the sync head to the cluster through a
//! [`ClusterApplier`], then moves the sync tag to the head and reports the
//! move to the loop's [`SyncTagTracker`]. How the apply works is up to the
//! applier.

use crate::daemon::{SyncAttempt, SyncRunner, SyncTagTracker};
use crate::{ReconcilerError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Where the sync tag lives
#[async_trait]
pub trait SyncTagStore: Send + Sync {
    /// Revision the tag points at, or `None` if the tag does not exist
    async fn tag_revision(&self, tag: &str) -> Result<Option<String>>;

    /// Point the tag at `revision` and publish it upstream
    async fn move_tag(&self, tag: &str, revision: &str) -> Result<()>;
}

/// Applies a revision's manifests to the cluster
#[async_trait]
pub trait ClusterApplier: Send + Sync {
    async fn apply(&self, revision: &str) -> Result<()>;
}

/// Applier that only logs; for dry runs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogApplier;

#[async_trait]
impl ClusterApplier for LogApplier {
    async fn apply(&self, revision: &str) -> Result<()> {
        tracing::info!(revision = %revision, "Dry run: would apply revision");
        Ok(())
    }
}

/// Sync runner backed by a tag store and an applier
#[derive(Clone)]
pub struct TagSync {
    sync_tag: String,
    store: Arc<dyn SyncTagStore>,
    applier: Arc<dyn ClusterApplier>,
}

impl TagSync {
    /// Create a runner moving `sync_tag` in `store` after each apply
    pub fn new(
        sync_tag: impl Into<String>,
        store: Arc<dyn SyncTagStore>,
        applier: Arc<dyn ClusterApplier>,
    ) -> Self {
        Self {
            sync_tag: sync_tag.into(),
            store,
            applier,
        }
    }
}

#[async_trait]
impl SyncRunner for TagSync {
    async fn new_sync(&self, head: &str) -> Result<Box<dyn SyncAttempt>> {
        if head.is_empty() {
            return Err(ReconcilerError::Sync(
                "No verified revision yet; waiting for the first mirror refresh".to_string(),
            ));
        }

        Ok(Box::new(TagSyncAttempt {
            started: Instant::now(),
            head: head.to_string(),
            sync_tag: self.sync_tag.clone(),
            store: self.store.clone(),
            applier: self.applier.clone(),
        }))
    }
}

struct TagSyncAttempt {
    started: Instant,
    head: String,
    sync_tag: String,
    store: Arc<dyn SyncTagStore>,
    applier: Arc<dyn ClusterApplier>,
}

#[async_trait]
impl SyncAttempt for TagSyncAttempt {
    fn started(&self) -> Instant {
        self.started
    }

    async fn run(&mut self, tag: &mut SyncTagTracker) -> Result<()> {
        let old = self
            .store
            .tag_revision(&self.sync_tag)
            .await?
            .unwrap_or_default();

        // Apply even when the tag is current: the cluster may have drifted
        self.applier.apply(&self.head).await?;

        if old == self.head {
            tracing::debug!(tag = %self.sync_tag, revision = %old, "Sync tag already current");
            return Ok(());
        }

        self.store.move_tag(&self.sync_tag, &self.head).await?;
        tag.set_revision(&old, &self.head);
        Ok(())
    }
}
