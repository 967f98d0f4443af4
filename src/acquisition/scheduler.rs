//! Poll Scheduler: reentrancy guard, schedule arithmetic and the timer thread.
//!
//! Each firing first tries the [`ReentrancyGuard`] without blocking. If another
//! firing's body is still running the new one is skipped, so a slow firing lowers the
//! effective rate instead of stacking work. The [`TimerThread`] calls the firing on a
//! fixed period and catches up after overruns instead of drifting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::error::{Result, TdcError};

const NANOS_PER_SEC: u64 = 1_000_000_000;

// =============================================================================
// Reentrancy guard
// =============================================================================

/// At-most-one-firing guard. Acquisition never blocks.
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    held: AtomicBool,
}

/// Result of [`ReentrancyGuard::try_enter`].
#[derive(Debug)]
pub enum Entry<'a> {
    /// The guard is ours until the token drops.
    Acquired(GuardToken<'a>),
    /// Another holder is inside.
    Contended,
}

/// Releases the guard on drop.
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a ReentrancyGuard,
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.guard.held.store(false, Ordering::Release);
    }
}

impl ReentrancyGuard {
    /// Create a free guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the guard.
    pub fn try_enter(&self) -> Entry<'_> {
        match self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Entry::Acquired(GuardToken { guard: self }),
            Err(_) => Entry::Contended,
        }
    }

    /// Whether someone holds the guard right now.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

// =============================================================================
// Schedule arithmetic
// =============================================================================

/// What a firing asks of its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Work done; fire again one period later.
    Rescheduled,
    /// The guard was contended; nothing was done.
    Skipped,
    /// The measurement is no longer running; the schedule ends.
    Terminated,
}

/// Who drives the firings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// A dedicated timer thread owned by the device.
    #[default]
    Thread,
    /// The caller invokes `fire` itself.
    Manual,
}

/// Permitted trigger rate range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    /// Lowest rate, Hz.
    pub min_rate_hz: u64,
    /// Highest rate, Hz.
    pub max_rate_hz: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            min_rate_hz: 1,
            max_rate_hz: 100_000,
        }
    }
}

impl RateLimits {
    /// Shortest permitted period in nanoseconds.
    pub fn min_period_ns(&self) -> u64 {
        NANOS_PER_SEC / self.max_rate_hz.max(1)
    }

    /// Longest permitted period in nanoseconds.
    pub fn max_period_ns(&self) -> u64 {
        NANOS_PER_SEC / self.min_rate_hz.max(1)
    }

    /// Validate a rate and convert it to a period.
    pub fn period_for_rate(&self, rate_hz: u64) -> Result<Duration> {
        if rate_hz < self.min_rate_hz || rate_hz > self.max_rate_hz {
            return Err(TdcError::invalid(format!(
                "trigger rate {} Hz outside {}..={} Hz",
                rate_hz, self.min_rate_hz, self.max_rate_hz
            )));
        }
        Ok(Duration::from_nanos(NANOS_PER_SEC / rate_hz))
    }

    /// Validate a period given in nanoseconds.
    pub fn check_period_ns(&self, period_ns: u64) -> Result<Duration> {
        if period_ns < self.min_period_ns() || period_ns > self.max_period_ns() {
            return Err(TdcError::invalid(format!(
                "trigger period {} ns outside {}..={} ns",
                period_ns,
                self.min_period_ns(),
                self.max_period_ns()
            )));
        }
        Ok(Duration::from_nanos(period_ns))
    }
}

/// Firings per second for a period.
pub fn rate_for_period(period: Duration) -> u64 {
    let ns = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX).max(1);
    NANOS_PER_SEC / ns
}

/// Advance `expiry` by whole periods until it lies after `now`.
///
/// Returns the new expiry and how many periods were skipped. An expiry still in the
/// future is left alone.
pub fn forward(expiry: Instant, now: Instant, period: Duration) -> (Instant, u64) {
    if now < expiry || period.is_zero() {
        return (expiry, 0);
    }
    let behind = now.duration_since(expiry).as_nanos();
    let periods = behind / period.as_nanos() + 1;
    let periods = u32::try_from(periods).unwrap_or(u32::MAX);
    (expiry + period * periods, u64::from(periods))
}

// =============================================================================
// Timer thread
// =============================================================================

#[derive(Debug, Default)]
struct TimerFlags {
    kicked: Option<Duration>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct TimerControl {
    flags: Mutex<TimerFlags>,
    cond: Condvar,
}

/// Calls a firing function periodically while a schedule is running.
///
/// The thread idles until [`kick`](Self::kick) starts a schedule, fires every period
/// until a firing returns [`FireOutcome::Terminated`], and goes back to idle.
#[derive(Debug)]
pub struct TimerThread {
    control: Arc<TimerControl>,
    handle: Option<JoinHandle<()>>,
}

impl TimerThread {
    /// Spawn the thread. `fire` returns the outcome and the period to use next, or
    /// `None` once its target is gone, which ends the thread.
    pub fn spawn<F>(name: &str, fire: F) -> Result<Self>
    where
        F: Fn() -> Option<(FireOutcome, Duration)> + Send + 'static,
    {
        let control = Arc::new(TimerControl::default());
        let thread_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&thread_control, fire))?;
        debug!(thread = name, "Spawned poll timer thread");
        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    /// Start firing, the first time one `period` from now.
    pub fn kick(&self, period: Duration) {
        let mut flags = self.control.flags.lock();
        flags.kicked = Some(period);
        self.control.cond.notify_all();
    }

    /// Stop the thread and wait for it.
    pub fn shutdown(&mut self) {
        {
            let mut flags = self.control.flags.lock();
            flags.shutdown = true;
            self.control.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                error!("Poll timer thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F>(control: &TimerControl, fire: F)
where
    F: Fn() -> Option<(FireOutcome, Duration)>,
{
    loop {
        let mut period = {
            let mut flags = control.flags.lock();
            loop {
                if flags.shutdown {
                    info!("Poll timer thread stopped");
                    return;
                }
                if let Some(period) = flags.kicked.take() {
                    break period;
                }
                control.cond.wait(&mut flags);
            }
        };
        let mut expiry = Instant::now() + period;
        let mut overruns = 0u64;
        loop {
            {
                let mut flags = control.flags.lock();
                while !flags.shutdown && Instant::now() < expiry {
                    control.cond.wait_until(&mut flags, expiry);
                }
                if flags.shutdown {
                    debug!("Poll timer thread exiting");
                    return;
                }
            }

            match fire() {
                None => return,
                Some((FireOutcome::Terminated, _)) => {
                    trace!(overruns, "Schedule terminated");
                    break;
                }
                Some((outcome, next_period)) => {
                    if outcome == FireOutcome::Skipped {
                        trace!("Firing skipped, previous firing still running");
                    }
                    period = next_period;
                    let (next, skipped) = forward(expiry, Instant::now(), period);
                    overruns += skipped.saturating_sub(1);
                    expiry = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_guard_is_exclusive() {
        let guard = ReentrancyGuard::new();
        let first = guard.try_enter();
        assert!(matches!(first, Entry::Acquired(_)));
        assert!(matches!(guard.try_enter(), Entry::Contended));
        assert!(guard.is_held());
        drop(first);
        assert!(!guard.is_held());
        assert!(matches!(guard.try_enter(), Entry::Acquired(_)));
    }

    #[test]
    fn test_rate_period_conversion() {
        let limits = RateLimits::default();
        assert_eq!(
            limits.period_for_rate(10_000).unwrap(),
            Duration::from_micros(100)
        );
        assert!(limits.period_for_rate(0).is_err());
        assert!(limits.period_for_rate(100_001).is_err());
        assert_eq!(limits.min_period_ns(), 10_000);
        assert_eq!(limits.max_period_ns(), 1_000_000_000);
        assert!(limits.check_period_ns(9_999).is_err());
        assert!(limits.check_period_ns(1_000_000_001).is_err());
        assert_eq!(rate_for_period(Duration::from_micros(100)), 10_000);
    }

    #[test]
    fn test_forward_catches_up_without_drift() {
        let t0 = Instant::now();
        let period = Duration::from_millis(10);

        let (next, n) = forward(t0 + period, t0, period);
        assert_eq!((next, n), (t0 + period, 0));

        // 35 ms late: skip to the first slot after now
        let (next, n) = forward(t0, t0 + Duration::from_millis(35), period);
        assert_eq!(next, t0 + Duration::from_millis(40));
        assert_eq!(n, 4);
    }

    #[test]
    fn test_timer_thread_fires_until_terminated() {
        let count = Arc::new(AtomicU64::new(0));
        let fired = Arc::clone(&count);
        let mut timer = TimerThread::spawn("test-poll", move || {
            let n = fired.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = if n >= 5 {
                FireOutcome::Terminated
            } else {
                FireOutcome::Rescheduled
            };
            Some((outcome, Duration::from_millis(1)))
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        timer.kick(Duration::from_millis(1));
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 5);
        timer.shutdown();
    }
}
