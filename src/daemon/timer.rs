//! One-shot interval timers for the event loop
//!
//! Each timer fires once per arming. Firing only asks a trigger; the work
//! happens when the trigger is consumed, and at that point the timer is
//! disarmed so a fire that landed meanwhile cannot cause a second action.
//! After the work the timer is rearmed for a full interval.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

/// A resettable timer that fires at most once per arming
#[derive(Debug)]
pub struct IntervalTimer {
    name: &'static str,
    interval: Duration,
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl IntervalTimer {
    /// Create a timer armed to fire after `interval`
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            sleep: Box::pin(sleep(interval)),
            armed: true,
        }
    }

    /// Wait for the timer to fire
    ///
    /// Never completes while the timer is disarmed. Cancel safe: the armed
    /// flag only clears in the same poll that observes the deadline.
    pub async fn fired(&mut self) {
        if !self.armed {
            pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }

    /// Stop the timer and throw away a fire nobody has observed yet
    ///
    /// Returns `true` if the timer was still counting down, `false` if it had
    /// already elapsed or was not armed.
    pub fn disarm(&mut self) -> bool {
        let counting = self.armed && self.sleep.deadline() > Instant::now();
        if self.armed && !counting {
            tracing::trace!(timer = self.name, "Discarding stale fire");
        }
        self.armed = false;
        counting
    }

    /// Arm the timer for a full interval from now
    pub fn rearm(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.interval);
        self.armed = true;
    }

    /// Whether a fire is scheduled or waiting to be observed
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// The configured interval
    pub fn interval(&self) -> Duration {
        self.interval
    }
}
