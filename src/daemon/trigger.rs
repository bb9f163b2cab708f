//! Debounced triggers
//!
//! A trigger is a single pending-request slot. Asking while a request is
//! already pending does nothing: the outstanding request will satisfy both
//! askers. The event loop consumes the slot through a [`TriggerWaiter`].
//!
//! Both halves are built together by [`trigger`], so there is no lazy
//! initialisation to race on.

use tokio::sync::mpsc::{self, error::TrySendError};

/// Asking side of a debounced trigger; cheap to clone and share
#[derive(Debug, Clone)]
pub struct Trigger {
    name: &'static str,
    tx: mpsc::Sender<()>,
}

/// Waiting side of a debounced trigger, owned by the event loop
#[derive(Debug)]
pub struct TriggerWaiter {
    name: &'static str,
    rx: mpsc::Receiver<()>,
}

/// Create a trigger and its waiter
pub fn trigger(name: &'static str) -> (Trigger, TriggerWaiter) {
    let (tx, rx) = mpsc::channel(1);
    (Trigger { name, tx }, TriggerWaiter { name, rx })
}

impl Trigger {
    /// Ask for the action, or let an already pending ask cover it
    ///
    /// Never blocks. Returns `true` if this call queued a new request and
    /// `false` if one was already pending.
    pub fn ask(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => {
                tracing::trace!(trigger = self.name, "Request queued");
                true
            }
            Err(TrySendError::Full(())) => {
                tracing::trace!(trigger = self.name, "Request already pending");
                false
            }
            Err(TrySendError::Closed(())) => {
                tracing::debug!(trigger = self.name, "Request dropped, event loop has stopped");
                false
            }
        }
    }

    /// Name used in log lines
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl TriggerWaiter {
    /// Wait for a pending request and consume it
    ///
    /// Cancel safe. The loop keeps a [`Trigger`] of its own, so the channel
    /// never closes while the waiter is in use; if it somehow does, this
    /// waits forever rather than spinning.
    pub async fn wait(&mut self) {
        if self.rx.recv().await.is_none() {
            tracing::debug!(trigger = self.name, "All askers gone");
            std::future::pending::<()>().await;
        }
    }

    /// Consume a pending request without waiting
    pub fn try_take(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}
