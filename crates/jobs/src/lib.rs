//! Job queue for the reconciler daemon
//!
//! A multi-producer, single-consumer queue of background jobs. Producers hold a
//! cloneable [`JobQueue`]; the daemon's event loop owns the one [`ReadyJobs`]
//! and runs each job inline, one at a time. Every job's progress is recorded in
//! a bounded status cache so producers can ask how their job went.
//!
//! # Example
//!
//! ```no_run
//! use jobs::{Job, JobId};
//!
//! # async fn demo() -> jobs::Result<()> {
//! let (queue, mut ready) = jobs::queue();
//!
//! let id = queue.enqueue(Job::from_fn(JobId::generate(), || async {
//!     // commit and push a manifest change
//!     Ok(())
//! }))?;
//!
//! if let Some(job) = ready.next().await {
//!     let job_id = job.id.clone();
//!     let outcome = job.run().await;
//!     ready.finish(&job_id, &outcome);
//! }
//!
//! println!("{:?}", queue.status(&id));
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

/// Default number of job statuses remembered
pub const DEFAULT_STATUS_CAPACITY: usize = 256;

/// Errors that can occur when queueing or running jobs
#[derive(Error, Debug)]
pub enum Error {
    #[error("job queue is closed")]
    QueueClosed,

    #[error("job failed: {0}")]
    Failed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a [`Error::Failed`] from anything printable
    pub fn failed(message: impl fmt::Display) -> Self {
        Error::Failed(message.to_string())
    }
}

/// Result type for job operations
pub type Result<T> = std::result::Result<T, Error>;

/// Job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a JobId from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an identifier unique within this process
    ///
    /// Format: `<unix-nanos-hex>-<sequence>`
    pub fn generate() -> Self {
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);

        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("{:x}-{:04}", nanos, seq))
    }

    /// Get the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The body of a job
///
/// Jobs run on the daemon's event loop, so a long action delays every other
/// trigger until it returns. A successful job is assumed to have pushed new
/// commits upstream.
#[async_trait]
pub trait JobAction: Send {
    /// Do the work, consuming the action
    async fn run(self: Box<Self>) -> Result<()>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> JobAction for FnAction<F>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(self: Box<Self>) -> Result<()> {
        (self.0)().await
    }
}

/// A queued unit of work
pub struct Job {
    /// Job identifier
    pub id: JobId,

    action: Box<dyn JobAction>,
}

impl Job {
    /// Create a job from an action
    pub fn new(id: JobId, action: impl JobAction + 'static) -> Self {
        Self {
            id,
            action: Box::new(action),
        }
    }

    /// Create a job from an async closure
    pub fn from_fn<F, Fut>(id: JobId, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(id, FnAction(f))
    }

    /// Run the job's action; a job can only run once
    pub async fn run(self) -> Result<()> {
        self.action.run().await
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed { error: String },
}

impl JobState {
    /// Whether the job has finished, successfully or not
    pub fn is_done(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed { .. })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed { .. } => write!(f, "failed"),
        }
    }
}

/// Status of a job, as reported to producers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    #[serde(flatten)]
    pub state: JobState,
    pub updated_at: DateTime<Utc>,
}

/// Bounded map of job statuses
///
/// Over capacity, the oldest finished entry is evicted first. Queued and
/// running jobs are never evicted, so the cache can exceed its capacity while
/// more than `capacity` jobs are waiting.
#[derive(Debug)]
struct StatusCache {
    capacity: usize,
    entries: HashMap<JobId, JobStatus>,
    order: VecDeque<JobId>,
}

impl StatusCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn set(&mut self, id: &JobId, state: JobState) {
        let status = JobStatus {
            id: id.clone(),
            state,
            updated_at: Utc::now(),
        };
        if self.entries.insert(id.clone(), status).is_none() {
            self.order.push_back(id.clone());
        }
        while self.order.len() > self.capacity {
            let finished = self.order.iter().position(|id| {
                self.entries
                    .get(id)
                    .map_or(true, |status| status.state.is_done())
            });
            let Some(pos) = finished else { break };
            if let Some(evicted) = self.order.remove(pos) {
                self.entries.remove(&evicted);
            }
        }
    }

    fn get(&self, id: &JobId) -> Option<JobStatus> {
        self.entries.get(id).cloned()
    }
}

#[derive(Debug)]
struct Shared {
    len: AtomicUsize,
    statuses: Mutex<StatusCache>,
}

impl Shared {
    fn statuses(&self) -> MutexGuard<'_, StatusCache> {
        // a panicking writer cannot leave the cache half-updated
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Producer side of the queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
}

/// Consumer side of the queue, owned by the event loop
#[derive(Debug)]
pub struct ReadyJobs {
    rx: mpsc::UnboundedReceiver<Job>,
    shared: Arc<Shared>,
}

/// Create a queue with the default status capacity
pub fn queue() -> (JobQueue, ReadyJobs) {
    queue_with_status_capacity(DEFAULT_STATUS_CAPACITY)
}

/// Create a queue remembering at most `capacity` finished job statuses
pub fn queue_with_status_capacity(capacity: usize) -> (JobQueue, ReadyJobs) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        len: AtomicUsize::new(0),
        statuses: Mutex::new(StatusCache::new(capacity)),
    });

    (
        JobQueue {
            tx,
            shared: shared.clone(),
        },
        ReadyJobs { rx, shared },
    )
}

impl JobQueue {
    /// Add a job to the back of the queue
    pub fn enqueue(&self, job: Job) -> Result<JobId> {
        let id = job.id.clone();

        // Recorded before sending so the consumer's Running is never overwritten
        self.shared.statuses().set(&id, JobState::Queued);
        self.shared.len.fetch_add(1, Ordering::SeqCst);

        if self.tx.send(job).is_err() {
            self.shared.len.fetch_sub(1, Ordering::SeqCst);
            self.shared.statuses().set(
                &id,
                JobState::Failed {
                    error: Error::QueueClosed.to_string(),
                },
            );
            return Err(Error::QueueClosed);
        }
        Ok(id)
    }

    /// Number of jobs waiting to run
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::SeqCst)
    }

    /// Whether no jobs are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last known status of a job, if it is still remembered
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.shared.statuses().get(id)
    }
}

impl ReadyJobs {
    /// Wait for the next job
    ///
    /// Cancel safe: dropping the future never loses a job. Returns `None` once
    /// every [`JobQueue`] handle is gone and the queue is drained.
    pub async fn next(&mut self) -> Option<Job> {
        let job = self.rx.recv().await?;
        self.shared.len.fetch_sub(1, Ordering::SeqCst);
        self.shared.statuses().set(&job.id, JobState::Running);
        Some(job)
    }

    /// Number of jobs still waiting behind the one being handled
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::SeqCst)
    }

    /// Whether no jobs are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record how a job ended
    pub fn finish(&self, id: &JobId, outcome: &Result<()>) {
        let state = match outcome {
            Ok(()) => JobState::Succeeded,
            Err(e) => JobState::Failed {
                error: e.to_string(),
            },
        };
        self.shared.statuses().set(id, state);
    }

    /// Last known status of a job
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.shared.statuses().get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_job_id_generate_is_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().contains('-'));
    }

    #[test]
    fn test_job_id_serializes_as_string() {
        let id = JobId::new("job-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"job-1\"");
    }

    #[tokio::test]
    async fn test_enqueue_and_next_tracks_len() {
        let (queue, mut ready) = queue();
        assert!(queue.is_empty());

        queue
            .enqueue(Job::from_fn(JobId::new("a"), || async { Ok(()) }))
            .unwrap();
        queue
            .enqueue(Job::from_fn(JobId::new("b"), || async { Ok(()) }))
            .unwrap();
        assert_eq!(queue.len(), 2);

        let job = ready.next().await.unwrap();
        assert_eq!(job.id, JobId::new("a"));
        assert_eq!(ready.len(), 1);

        let job = ready.next().await.unwrap();
        assert_eq!(job.id, JobId::new("b"));
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (queue, mut ready) = queue();
        let id = queue
            .enqueue(Job::from_fn(JobId::new("j"), || async {
                Err(Error::failed("push rejected"))
            }))
            .unwrap();
        assert_eq!(queue.status(&id).unwrap().state, JobState::Queued);

        let job = ready.next().await.unwrap();
        assert_eq!(queue.status(&id).unwrap().state, JobState::Running);

        let outcome = job.run().await;
        ready.finish(&id, &outcome);

        let status = queue.status(&id).unwrap();
        assert!(status.state.is_done());
        assert_eq!(
            status.state,
            JobState::Failed {
                error: "job failed: push rejected".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_job_runs_its_action() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let job = Job::from_fn(JobId::new("x"), move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        job.run().await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_status_cache_evicts_oldest_finished() {
        let mut cache = StatusCache::new(2);
        cache.set(&JobId::new("1"), JobState::Succeeded);
        cache.set(&JobId::new("2"), JobState::Queued);
        cache.set(&JobId::new("3"), JobState::Succeeded);
        cache.set(&JobId::new("4"), JobState::Queued);

        assert!(cache.get(&JobId::new("1")).is_none());
        assert!(cache.get(&JobId::new("2")).is_some());
        assert!(cache.get(&JobId::new("3")).is_none());
        assert!(cache.get(&JobId::new("4")).is_some());
    }

    #[test]
    fn test_status_cache_keeps_pending_over_capacity() {
        let mut cache = StatusCache::new(2);
        for i in 0..5 {
            cache.set(&JobId::new(i.to_string()), JobState::Queued);
        }
        for i in 0..5 {
            assert!(cache.get(&JobId::new(i.to_string())).is_some());
        }

        // Finishing a job makes room again
        cache.set(&JobId::new("0"), JobState::Succeeded);
        cache.set(&JobId::new("5"), JobState::Queued);
        assert!(cache.get(&JobId::new("0")).is_none());
        assert!(cache.get(&JobId::new("5")).is_some());
    }

    #[tokio::test]
    async fn test_queued_status_survives_a_long_queue() {
        let (queue, _ready) = queue_with_status_capacity(4);
        let first = queue
            .enqueue(Job::from_fn(JobId::new("first"), || async { Ok(()) }))
            .unwrap();
        for i in 0..10 {
            queue
                .enqueue(Job::from_fn(JobId::new(format!("later-{}", i)), || async {
                    Ok(())
                }))
                .unwrap();
        }

        assert_eq!(queue.status(&first).unwrap().state, JobState::Queued);
    }

    #[test]
    fn test_enqueue_after_consumer_dropped() {
        let (queue, ready) = queue();
        drop(ready);

        let result = queue.enqueue(Job::from_fn(JobId::new("late"), || async { Ok(()) }));
        assert!(matches!(result, Err(Error::QueueClosed)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_job_state_json_shape() {
        let status = JobStatus {
            id: JobId::new("j1"),
            state: JobState::Failed {
                error: "boom".to_string(),
            },
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["id"], "j1");
        assert_eq!(value["state"], "failed");
        assert_eq!(value["error"], "boom");
    }
}
