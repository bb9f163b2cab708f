//! The reconciler event loop
//!
//! A single tokio task multiplexes every source of work: the stop signal,
//! the sync and image-poll triggers, their interval timers, mirror refresh
//! notifications and the job queue. Exactly one ready source is handled per
//! iteration, and its handler runs to completion before the loop waits again,
//! so syncs, polls and jobs never overlap.

use super::interfaces::{ImagePoller, Repo, SyncRunner};
use super::metrics;
use super::revision::latest_valid_revision;
use super::sync_tag::SyncTagTracker;
use super::timer::IntervalTimer;
use super::trigger::{trigger, Trigger, TriggerWaiter};
use crate::config::{GitConfig, LoopConfig};
use crate::{ReconcilerError, Result};
use jobs::{Job, ReadyJobs};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::Instrument;

/// Cloneable handle for asking the loop to act
///
/// Asks are debounced: while a request is pending, further asks are no-ops.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    sync: Trigger,
    image_poll: Trigger,
}

impl LoopHandle {
    /// Ask for a sync, or if there's one waiting, let that happen
    ///
    /// Returns `true` if this call queued the request.
    pub fn ask_for_sync(&self) -> bool {
        self.sync.ask()
    }

    /// Ask for an image poll, or if there's one waiting, let that happen
    ///
    /// Returns `true` if this call queued the request.
    pub fn ask_for_image_poll(&self) -> bool {
        self.image_poll.ask()
    }
}

/// Everything the loop drives but does not own the logic of
pub struct Collaborators {
    /// Mirrored configuration repository
    pub repo: Arc<dyn Repo>,

    /// Fires once each time the mirror has fetched from upstream
    pub refreshed: mpsc::Receiver<()>,

    /// Builds sync attempts
    pub syncer: Arc<dyn SyncRunner>,

    /// Looks for new images
    pub poller: Arc<dyn ImagePoller>,

    /// Consumer side of the job queue
    pub jobs: ReadyJobs,
}

/// The reconciler event loop
pub struct EventLoop {
    config: LoopConfig,
    git: GitConfig,

    repo: Arc<dyn Repo>,
    refreshed: mpsc::Receiver<()>,
    syncer: Arc<dyn SyncRunner>,
    poller: Arc<dyn ImagePoller>,
    jobs: ReadyJobs,

    handle: LoopHandle,
    sync_soon: TriggerWaiter,
    poll_images_soon: TriggerWaiter,
    sync_timer: IntervalTimer,
    image_poll_timer: IntervalTimer,

    /// Current verified head of the branch. A mirror refresh only asks for a
    /// sync when this changes; otherwise every refresh would sync.
    sync_head: String,

    /// Created once and kept for the loop's lifetime, so a tag moved by
    /// another writer between two of our attempts is still noticed. A tracker
    /// rebuilt per attempt could only see changes within one attempt.
    sync_tag: SyncTagTracker,
}

impl EventLoop {
    /// Create a loop; nothing runs until [`EventLoop::run`]
    pub fn new(config: LoopConfig, git: GitConfig, collaborators: Collaborators) -> Self {
        let (sync, sync_soon) = trigger("sync");
        let (image_poll, poll_images_soon) = trigger("image_poll");

        Self {
            sync_timer: IntervalTimer::new("sync", config.sync_interval),
            image_poll_timer: IntervalTimer::new("image_poll", config.poll_interval),
            sync_tag: SyncTagTracker::new(git.sync_tag.clone()),
            config,
            git,
            repo: collaborators.repo,
            refreshed: collaborators.refreshed,
            syncer: collaborators.syncer,
            poller: collaborators.poller,
            jobs: collaborators.jobs,
            handle: LoopHandle { sync, image_poll },
            sync_soon,
            poll_images_soon,
            sync_head: String::new(),
        }
    }

    /// Get a handle for asking the loop to sync or poll
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Revision the loop currently treats as the desired state
    pub fn sync_head(&self) -> &str {
        &self.sync_head
    }

    /// Sync tag bookkeeping
    pub fn sync_tag(&self) -> &SyncTagTracker {
        &self.sync_tag
    }

    /// Run until `stop` fires or its sender is dropped
    ///
    /// Stop is only noticed between handlers; a sync or job in progress
    /// finishes first. Await the task running this future to know the loop
    /// is done.
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        // Intervals count from the start of the loop, not from construction
        self.sync_timer.rearm();
        self.image_poll_timer.rearm();

        // Sync and poll straight away
        self.handle.ask_for_sync();
        self.handle.ask_for_image_poll();

        tracing::info!(
            sync_interval_secs = self.config.sync_interval.as_secs(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            branch = %self.git.branch,
            "Event loop started"
        );

        loop {
            tokio::select! {
                _ = &mut stop => {
                    tracing::info!("Stopping event loop");
                    return;
                }
                _ = self.poll_images_soon.wait() => {
                    self.poll_images().await;
                }
                _ = self.image_poll_timer.fired() => {
                    self.handle.ask_for_image_poll();
                }
                _ = self.sync_soon.wait() => {
                    self.sync().await;
                }
                _ = self.sync_timer.fired() => {
                    self.handle.ask_for_sync();
                }
                Some(()) = self.refreshed.recv() => {
                    self.on_refreshed().await;
                }
                Some(job) = self.jobs.next() => {
                    self.on_job(job).await;
                }
            }
        }
    }

    async fn poll_images(&mut self) {
        self.image_poll_timer.disarm();
        self.poller.poll_for_new_images().await;
        self.image_poll_timer.rearm();
    }

    async fn sync(&mut self) {
        self.sync_timer.disarm();

        match self.syncer.new_sync(&self.sync_head).await {
            Ok(mut attempt) => {
                let result = attempt.run(&mut self.sync_tag).await;
                let elapsed = attempt.started().elapsed();
                metrics::record_sync_duration(result.is_ok(), elapsed.as_secs_f64());

                match result {
                    Ok(()) => tracing::info!(
                        head = %self.sync_head,
                        duration_ms = elapsed.as_millis() as u64,
                        "Sync completed"
                    ),
                    Err(e) => tracing::error!(head = %self.sync_head, error = %e, "Sync failed"),
                }
            }
            Err(e) => {
                // No backoff: the next attempt comes with the next tick or head change
                tracing::error!(head = %self.sync_head, error = %e, "Failed to prepare sync");
            }
        }

        self.sync_timer.rearm();
    }

    /// Compare the freshly fetched branch with the sync head
    ///
    /// Returns `true` if the head moved and a sync was asked for.
    async fn on_refreshed(&mut self) -> bool {
        let url = self.repo.origin_url();
        let resolved = match timeout(
            self.git.timeout,
            latest_valid_revision(self.repo.as_ref(), &self.git),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ReconcilerError::timeout("revision lookup", self.git.timeout)),
        };

        let (new_head, invalid_commit) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!(url = %url, error = %e, "Failed to resolve latest valid revision");
                return false;
            }
        };

        if let Some(invalid) = invalid_commit {
            tracing::warn!(
                revision = %invalid.revision,
                key = %invalid.signature.key,
                status = %invalid.signature.status,
                "Found invalid GPG signature for commit"
            );
        }

        tracing::info!(url = %url, branch = %self.git.branch, head = %new_head, "Mirror refreshed");

        if new_head == self.sync_head {
            return false;
        }

        tracing::debug!(old = %self.sync_head, new = %new_head, "Sync head moved");
        self.sync_head = new_head;
        self.handle.ask_for_sync();
        true
    }

    async fn on_job(&mut self, job: Job) {
        metrics::set_queue_length(self.jobs.len());

        let job_id = job.id.clone();
        let span = tracing::info_span!("job", job_id = %job_id);

        async {
            tracing::info!(state = "in-progress", "Running job");

            let start = Instant::now();
            let outcome = job.run().await;
            metrics::record_job_duration(outcome.is_ok(), start.elapsed().as_secs_f64());
            self.jobs.finish(&job_id, &outcome);

            match outcome {
                Ok(()) => {
                    tracing::info!(state = "done", success = true, "Job finished");
                    // Successful jobs are assumed to have pushed commits; fetch them
                    // so the next refresh notification can pick them up
                    if let Err(e) = self.refresh_repo().await {
                        tracing::error!(error = %e, "Failed to refresh after job");
                    }
                }
                Err(e) => {
                    tracing::error!(state = "done", success = false, error = %e, "Job failed");
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn refresh_repo(&self) -> Result<()> {
        match timeout(self.git.timeout, self.repo.refresh()).await {
            Ok(result) => result,
            Err(_) => Err(ReconcilerError::timeout("refresh", self.git.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::interfaces::{NoopImagePoller, SyncAttempt};
    use crate::daemon::revision::{Commit, Signature, SignatureStatus};
    use async_trait::async_trait;
    use jobs::JobId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeRepo {
        head: Mutex<String>,
        fail_lookup: Mutex<bool>,
        commits: Mutex<Vec<Commit>>,
        refreshes: AtomicUsize,
    }

    impl FakeRepo {
        fn set_head(&self, head: &str) {
            *self.head.lock().unwrap() = head.to_string();
        }
    }

    #[async_trait]
    impl Repo for FakeRepo {
        fn origin_url(&self) -> String {
            "file:///fake".to_string()
        }

        async fn refresh(&self) -> Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn branch_head(&self, _branch: &str) -> Result<String> {
            if *self.fail_lookup.lock().unwrap() {
                return Err(ReconcilerError::Git("branch not found".to_string()));
            }
            Ok(self.head.lock().unwrap().clone())
        }

        async fn verify_tag(&self, _tag: &str) -> Result<Option<String>> {
            Ok(Some("tagged".to_string()))
        }

        async fn commits_between(
            &self,
            _from: &str,
            _to: &str,
            _paths: &[String],
        ) -> Result<Vec<Commit>> {
            Ok(self.commits.lock().unwrap().clone())
        }
    }

    struct NoSync;

    #[async_trait]
    impl SyncRunner for NoSync {
        async fn new_sync(&self, _head: &str) -> Result<Box<dyn SyncAttempt>> {
            Err(ReconcilerError::Sync("not in this test".to_string()))
        }
    }

    fn event_loop(repo: Arc<FakeRepo>, git: GitConfig) -> (EventLoop, jobs::JobQueue) {
        let (queue, ready) = jobs::queue();
        let (_tx, refreshed) = mpsc::channel(1);
        let collaborators = Collaborators {
            repo,
            refreshed,
            syncer: Arc::new(NoSync),
            poller: Arc::new(NoopImagePoller),
            jobs: ready,
        };
        let config = LoopConfig::new(Duration::from_secs(300), Duration::from_secs(300));
        (EventLoop::new(config, git, collaborators), queue)
    }

    fn git() -> GitConfig {
        GitConfig::new("file:///fake").with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_refresh_with_new_head_asks_for_sync() {
        let repo = Arc::new(FakeRepo::default());
        repo.set_head("abc");
        let (mut el, _queue) = event_loop(repo, git());

        assert!(el.on_refreshed().await);
        assert_eq!(el.sync_head(), "abc");
        assert!(el.sync_soon.try_take());
        assert!(!el.sync_soon.try_take());
    }

    #[tokio::test]
    async fn test_refresh_with_same_head_does_nothing() {
        let repo = Arc::new(FakeRepo::default());
        repo.set_head("abc");
        let (mut el, _queue) = event_loop(repo, git());

        el.on_refreshed().await;
        assert!(el.sync_soon.try_take());

        assert!(!el.on_refreshed().await);
        assert!(!el.on_refreshed().await);
        assert!(!el.sync_soon.try_take());
        assert_eq!(el.sync_head(), "abc");
    }

    #[tokio::test]
    async fn test_refresh_lookup_error_leaves_head() {
        let repo = Arc::new(FakeRepo::default());
        repo.set_head("abc");
        let (mut el, _queue) = event_loop(repo.clone(), git());
        el.on_refreshed().await;
        el.sync_soon.try_take();

        repo.set_head("def");
        *repo.fail_lookup.lock().unwrap() = true;

        assert!(!el.on_refreshed().await);
        assert_eq!(el.sync_head(), "abc");
        assert!(!el.sync_soon.try_take());
    }

    #[tokio::test]
    async fn test_invalid_commit_still_syncs_valid_ancestor() {
        let repo = Arc::new(FakeRepo::default());
        repo.set_head("c2");
        *repo.commits.lock().unwrap() = vec![
            Commit {
                revision: "c2".to_string(),
                signature: Signature {
                    key: "EVIL".to_string(),
                    status: SignatureStatus::Bad,
                },
            },
            Commit {
                revision: "c1".to_string(),
                signature: Signature {
                    key: "GOOD".to_string(),
                    status: SignatureStatus::Good,
                },
            },
        ];
        let (mut el, _queue) = event_loop(repo, git().with_verify_signatures(true));

        assert!(el.on_refreshed().await);
        assert_eq!(el.sync_head(), "c1");
    }

    #[tokio::test]
    async fn test_successful_job_refreshes_once() {
        let repo = Arc::new(FakeRepo::default());
        let (mut el, queue) = event_loop(repo.clone(), git());

        let id = queue
            .enqueue(Job::from_fn(JobId::new("ok"), || async { Ok(()) }))
            .unwrap();
        let job = el.jobs.next().await.unwrap();
        el.on_job(job).await;

        assert_eq!(repo.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(queue.status(&id).unwrap().state, jobs::JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_refresh() {
        let repo = Arc::new(FakeRepo::default());
        let (mut el, queue) = event_loop(repo.clone(), git());

        let id = queue
            .enqueue(Job::from_fn(JobId::new("bad"), || async {
                Err(jobs::Error::failed("push rejected"))
            }))
            .unwrap();
        let job = el.jobs.next().await.unwrap();
        el.on_job(job).await;

        assert_eq!(repo.refreshes.load(Ordering::SeqCst), 0);
        assert!(matches!(
            queue.status(&id).unwrap().state,
            jobs::JobState::Failed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sync_construction_rearms_timer() {
        let repo = Arc::new(FakeRepo::default());
        let (mut el, _queue) = event_loop(repo, git());

        el.sync().await;
        assert!(el.sync_timer.is_armed());
    }
}
