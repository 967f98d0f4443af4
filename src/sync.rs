//! Blocking notification used for "measurement stopped" and "data ready".
//!
//! A [`Signal`] pairs a condition variable with an interrupt counter. Waiters state the
//! condition they wait for as a predicate and get one of three outcomes back, so a
//! caller can tell a satisfied wait from an interrupted or expired one.
//!
//! An interrupt reaches only the waits already in progress when it is raised. Waits
//! that begin later never see it.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// How a [`Signal::wait_until`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate became true.
    Satisfied,
    /// [`Signal::interrupt`] was called while waiting.
    Interrupted,
    /// The timeout elapsed first.
    TimedOut,
}

/// Condition-variable notification with explicit interruption.
#[derive(Debug, Default)]
pub struct Signal {
    /// Number of interrupts raised so far.
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    /// Create a signal with no interrupt raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter so it re-checks its predicate.
    ///
    /// The state the predicate observes must be updated before calling this.
    pub fn notify_all(&self) {
        let _guard = self.epoch.lock();
        self.cond.notify_all();
    }

    /// Interrupt every wait in progress. A no-op when nobody is waiting.
    pub fn interrupt(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Current interrupt epoch, for a caller that waits more than once and must not
    /// miss an interrupt raised between its waits. See [`wait_since`](Self::wait_since).
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Block until `done` returns true, the signal is interrupted, or `timeout` elapses.
    /// `None` waits without a deadline.
    pub fn wait_until(
        &self,
        done: impl FnMut() -> bool,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        let mut guard = self.epoch.lock();
        let since = *guard;
        self.wait_locked(&mut guard, since, done, timeout)
    }

    /// Like [`wait_until`](Self::wait_until), but any interrupt raised after `since`
    /// was taken from [`epoch`](Self::epoch) ends the wait.
    pub fn wait_since(
        &self,
        since: u64,
        done: impl FnMut() -> bool,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        let mut guard = self.epoch.lock();
        self.wait_locked(&mut guard, since, done, timeout)
    }

    fn wait_locked(
        &self,
        guard: &mut MutexGuard<'_, u64>,
        since: u64,
        mut done: impl FnMut() -> bool,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if done() {
                return WaitOutcome::Satisfied;
            }
            if **guard != since {
                return WaitOutcome::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(guard, deadline).timed_out() {
                        return if done() {
                            WaitOutcome::Satisfied
                        } else if **guard != since {
                            WaitOutcome::Interrupted
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
                None => self.cond.wait(guard),
            }
        }
    }
}
