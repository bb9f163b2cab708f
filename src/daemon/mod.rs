//! Reconciler daemon core
//!
//! The event loop that decides when to sync the cluster with the
//! configuration repository, when to poll for new images, and when to run
//! queued jobs.
//!
//! # Architecture
//!
//! Everything funnels into one task:
//!
//! - **Triggers**: debounced "sync soon" / "poll images soon" requests. Any
//!   number of asks while one is pending collapse into one.
//! - **Timers**: a sync timer and an image poll timer. Firing only asks the
//!   matching trigger, so timer ticks and explicit asks share a code path.
//! - **Mirror notifications**: after each fetch the loop resolves the newest
//!   valid revision and asks for a sync only if it differs from the sync head.
//! - **Jobs**: one ready job per iteration, run inline; success triggers a
//!   mirror refresh so pushed commits are seen.
//!
//! # Example
//!
//! ```ignore
//! use reconciler::daemon::{Collaborators, EventLoop};
//!
//! let (queue, ready) = jobs::queue();
//! let event_loop = EventLoop::new(config.event_loop, config.git, Collaborators {
//!     repo, refreshed, syncer, poller, jobs: ready,
//! });
//! let handle = event_loop.handle();
//!
//! let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
//! let task = tokio::spawn(event_loop.run(stop_rx));
//!
//! handle.ask_for_sync();
//! let _ = stop_tx.send(());
//! task.await?;
//! ```

mod event_loop;
mod interfaces;
pub mod metrics;
mod revision;
mod sync_tag;
mod timer;
mod trigger;

pub use event_loop::{Collaborators, EventLoop, LoopHandle};
pub use interfaces::{ImagePoller, NoopImagePoller, Repo, SyncAttempt, SyncRunner};
pub use revision::{
    latest_valid_revision, Commit, InvalidCommit, Signature, SignatureStatus,
};
pub use sync_tag::SyncTagTracker;
pub use timer::IntervalTimer;
pub use trigger::{trigger, Trigger, TriggerWaiter};
