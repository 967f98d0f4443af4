//! The TDC device: one context object shared by the poll schedule, the control
//! operations and the consumer.
//!
//! ```text
//!   control thread            timer thread (or manual fire)        consumer
//!   start/pause/stop/...      fire()                               EventReader
//!        │                      │                                     │
//!        ├── guard ─────────────┤ try_enter, skip if held             │
//!        ├── core mutex ────────┤ card, measurement, cache, stats     │
//!        │                      └──► ring buffer ◄────────────────────┤ read
//!        └── waits on `stopped` ◄── notify           notify ──► waits on `data_ready`
//! ```
//!
//! Locks are always taken in the order guard, core, ring. Firings never block on the
//! guard; control operations either fail with `Busy` or wait on the `stopped` signal,
//! never while holding the core mutex. The consumer touches only the ring buffer and
//! the `data_ready` signal.
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use tdc_daq::acquisition::{TdcDevice, WaitPolicy};
//! use tdc_daq::config::TdcConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TdcConfig::load()?;
//! let device = TdcDevice::open(&config)?;
//! let mut reader = device.reader()?;
//!
//! device.start(Some(1000))?;
//! while let Some(event) = reader.read_event(Some(Duration::from_secs(5)))? {
//!     println!("{} hits", event.len());
//! }
//! device.stop(WaitPolicy::BLOCK)?;
//! device.detach()?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::cache::EventCache;
use super::decode::{DecodeEngine, FlushOutcome};
use super::measurement::{Measurement, MeasurementState, StartKind};
use super::scheduler::{
    rate_for_period, DriverKind, Entry, FireOutcome, RateLimits, ReentrancyGuard, TimerThread,
};
use super::stats::RateTracker;
use crate::config::TdcConfig;
use crate::data::event::EventRecord;
use crate::data::{EventDecoder, EventRingBuffer};
use crate::error::{Result, TdcError};
use crate::hardware::{CardSettings, ComMode, DevPort, FaultFlags, PortIo, TdcCard};
use crate::status::{fault_names, BufferStatus, StatusSnapshot};
use crate::sync::{Signal, WaitOutcome};
use crate::timing;

/// Bounded wait used by configuration commands when a firing is in flight.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Chunk size for [`EventReader::read_event`].
const READ_CHUNK: usize = 4096;

/// How a control operation behaves when a poll firing is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Fail with `Busy`; the caller retries.
    NonBlocking,
    /// Wait for the firing to finish. `None` waits without a deadline.
    Block {
        /// Longest wait.
        timeout: Option<Duration>,
    },
}

impl WaitPolicy {
    /// Block without a deadline.
    pub const BLOCK: Self = Self::Block { timeout: None };
}

// =============================================================================
// Shared state
// =============================================================================

/// Everything a firing mutates. Guarded by the core mutex, entered only while the
/// reentrancy guard is held.
#[derive(Debug)]
struct Core {
    card: TdcCard,
    measurement: Measurement,
    cache: EventCache,
    engine: DecodeEngine,
    tracker: RateTracker,
    window_override: Option<u64>,
}

/// Outcome of one poll body.
#[derive(Debug, Default)]
struct PollReport {
    wrote: bool,
    stopped: bool,
}

impl Core {
    fn disarm_if_armed(&mut self) {
        if self.card.is_initialized() {
            if let Err(e) = self.card.disarm() {
                self.hardware_fault("disarm", &e);
            }
        }
    }

    fn rearm(&mut self) {
        self.disarm_if_armed();
        if let Err(e) = self.card.arm() {
            self.hardware_fault("arm", &e);
        }
    }

    fn hardware_fault(&mut self, operation: &'static str, error: &TdcError) {
        warn!(operation, error = %error, "TDC hardware access failed");
        self.measurement.raise(FaultFlags::HARDWARE_IO);
    }

    fn rebuild_tracker(&mut self, period: Duration) {
        let window = self
            .window_override
            .unwrap_or_else(|| rate_for_period(period).max(1));
        self.tracker = RateTracker::new(window, period);
    }

    /// Apply new card settings. The registers are reprogrammed right away unless a
    /// measurement is running or paused; then they take effect at the next fresh start.
    fn apply_settings(&mut self, settings: CardSettings) -> Result<()> {
        settings.validate()?;
        self.card.set_settings(settings)?;
        self.cache.reconfigure(
            usize::from(settings.channel_count),
            usize::from(settings.max_hits_per_channel),
        );
        match self.measurement.state() {
            MeasurementState::New | MeasurementState::Stopped => self.card.setup(),
            MeasurementState::Started | MeasurementState::Paused => Ok(()),
        }
    }

    /// The body of a firing while the measurement is running.
    fn poll(&mut self, ring: &EventRingBuffer, now: Instant) -> PollReport {
        let mut report = PollReport::default();
        match self.card.has_reference_pulse() {
            Ok(false) => {}
            Ok(true) => {
                let counted = if self.measurement.limit_reached() {
                    info!(
                        limit = self.measurement.pulse_limit(),
                        "Pulse limit reached, stopping measurement"
                    );
                    self.measurement.stop(now);
                    report.stopped = true;
                    false
                } else {
                    self.measurement.counters_mut().pulses += 1;
                    true
                };
                report.wrote = self.read_hits(ring, counted);
                self.rearm();
            }
            Err(e) => {
                self.hardware_fault("has_reference_pulse", &e);
                self.rearm();
            }
        }
        self.tick_rates();
        report
    }

    fn read_hits(&mut self, ring: &EventRingBuffer, counted: bool) -> bool {
        match self.card.poll_for_hits() {
            Ok(true) => match self.engine.decode_event(
                &mut self.card,
                &mut self.cache,
                &mut self.measurement,
                ring,
            ) {
                Ok(report) => {
                    if let Some(loss) = report.loss() {
                        debug!(error = %loss, read = report.read, "Event data lost");
                    }
                    trace!(read = report.read, accepted = report.accepted, "Event decoded");
                    matches!(report.flush, FlushOutcome::Written { .. })
                }
                Err(e) => {
                    // Hits read before the failure were flushed.
                    self.hardware_fault("read_next_hit", &e);
                    true
                }
            },
            Ok(false) => {
                if counted {
                    self.measurement.counters_mut().pulses_without_hits += 1;
                }
                false
            }
            Err(e) => {
                self.hardware_fault("poll_for_hits", &e);
                false
            }
        }
    }

    fn tick_rates(&mut self) {
        let counters = self.measurement.counters();
        let (pulses, hits) = (counters.pulses, counters.valid_hits_sum);
        if let Some(rates) = self.tracker.tick(pulses, hits) {
            trace!(
                pulse_rate_hz = rates.pulse_rate_hz,
                hit_rate_hz = rates.hit_rate_hz,
                "Rates updated"
            );
            self.measurement.set_rates(rates);
            let silent = rates.pulse_rate_hz == 0.0 && !self.card.is_absent();
            self.measurement.set_fault(FaultFlags::NO_COM, silent);
        }
    }
}

#[derive(Debug)]
struct Shared {
    core: Mutex<Core>,
    ring: EventRingBuffer,
    guard: ReentrancyGuard,
    schedule_active: AtomicBool,
    state: AtomicU8,
    period_ns: AtomicU64,
    /// Raised whenever a firing lets go of the guard or a control operation finishes.
    stopped: Signal,
    /// Raised when event data was written or the end of data may have been reached.
    data_ready: Signal,
    reader_attached: AtomicBool,
    detached: AtomicBool,
    limits: RateLimits,
    driver: DriverKind,
    clock_resolution: Duration,
}

impl Shared {
    fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns.load(Ordering::Acquire))
    }

    fn state(&self) -> MeasurementState {
        MeasurementState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn publish(&self, core: &Core) {
        self.state
            .store(core.measurement.state().as_u8(), Ordering::Release);
    }

    /// No more data will be produced until the next start.
    fn end_of_data(&self) -> bool {
        self.state() == MeasurementState::Stopped && !self.schedule_active.load(Ordering::Acquire)
    }

    fn fire(&self) -> FireOutcome {
        let token = match self.guard.try_enter() {
            Entry::Acquired(token) => token,
            Entry::Contended => {
                trace!("Poll firing skipped, previous firing still running");
                return FireOutcome::Skipped;
            }
        };

        let (outcome, report) = {
            let mut core = self.core.lock();
            if core.measurement.state() == MeasurementState::Started {
                let report = core.poll(&self.ring, Instant::now());
                self.publish(&core);
                (FireOutcome::Rescheduled, report)
            } else {
                core.disarm_if_armed();
                self.schedule_active.store(false, Ordering::Release);
                debug!(state = %core.measurement.state(), "Poll schedule terminated");
                (FireOutcome::Terminated, PollReport::default())
            }
        };
        drop(token);

        self.stopped.notify_all();
        if report.wrote || report.stopped || outcome == FireOutcome::Terminated {
            self.data_ready.notify_all();
        }
        outcome
    }

    /// Run `f` with the guard and the core mutex held.
    fn exclusive<T>(
        &self,
        policy: WaitPolicy,
        f: impl FnOnce(&mut Core) -> Result<T>,
    ) -> Result<T> {
        let deadline = match policy {
            WaitPolicy::Block {
                timeout: Some(timeout),
            } => Some(Instant::now() + timeout),
            _ => None,
        };
        let since = self.stopped.epoch();
        loop {
            match self.guard.try_enter() {
                Entry::Acquired(token) => {
                    let result = {
                        let mut core = self.core.lock();
                        let result = f(&mut core);
                        self.publish(&core);
                        result
                    };
                    drop(token);
                    self.stopped.notify_all();
                    self.data_ready.notify_all();
                    return result;
                }
                Entry::Contended => match policy {
                    WaitPolicy::NonBlocking => {
                        return Err(TdcError::busy("poll firing in progress"))
                    }
                    WaitPolicy::Block { .. } => {
                        let remaining =
                            deadline.map(|d| d.saturating_duration_since(Instant::now()));
                        match self.stopped.wait_since(since, || !self.guard.is_held(), remaining) {
                            WaitOutcome::Satisfied => continue,
                            WaitOutcome::Interrupted => {
                                return Err(TdcError::Interrupted {
                                    waiting_for: "poll firing to finish",
                                })
                            }
                            WaitOutcome::TimedOut => {
                                return Err(TdcError::WaitTimedOut {
                                    waiting_for: "poll firing to finish",
                                })
                            }
                        }
                    }
                },
            }
        }
    }

    /// End the schedule if the measurement is no longer running. Caller holds the guard.
    fn halt(&self, core: &mut Core) {
        if core.measurement.state() != MeasurementState::Started {
            core.disarm_if_armed();
            self.schedule_active.store(false, Ordering::Release);
        }
    }
}

// =============================================================================
// Device
// =============================================================================

/// An attached TDC card with its measurement, event buffer and poll schedule.
#[derive(Debug)]
pub struct TdcDevice {
    shared: Arc<Shared>,
    timer: Mutex<Option<TimerThread>>,
}

impl TdcDevice {
    /// Open the card described by `config` through the port device.
    ///
    /// Fails before touching the hardware if the host clock is too coarse, and with
    /// `RegionUnavailable` if the port range cannot be reserved.
    pub fn open(config: &TdcConfig) -> Result<Self> {
        config.validate()?;
        let resolution =
            timing::require_resolution(config.scheduler.required_clock_resolution_ns)?;
        let port = DevPort::open_path(&config.device.port_path, config.device.base_address)?;
        Self::attach_with(Box::new(port), config, resolution)
    }

    /// Attach to a card behind any port backend, e.g. a [`MockTdcCard`].
    ///
    /// [`MockTdcCard`]: crate::hardware::MockTdcCard
    pub fn attach(io: Box<dyn PortIo>, config: &TdcConfig) -> Result<Self> {
        config.validate()?;
        let resolution = timing::clock_resolution()?;
        Self::attach_with(io, config, resolution)
    }

    fn attach_with(
        io: Box<dyn PortIo>,
        config: &TdcConfig,
        clock_resolution: Duration,
    ) -> Result<Self> {
        let settings = config.device.card_settings();
        let mut card = TdcCard::new(io, settings);
        if config.device.probe {
            card.probe()?;
        }
        card.setup()?;

        let period = config.scheduler.period;
        let mut core = Core {
            card,
            measurement: Measurement::new(usize::from(settings.channel_count)),
            cache: EventCache::new(
                usize::from(settings.channel_count),
                usize::from(settings.max_hits_per_channel),
            ),
            engine: DecodeEngine::new(config.scheduler.producer_lock_timeout),
            tracker: RateTracker::new(1, period),
            window_override: config.scheduler.stats_window_firings,
        };
        core.rebuild_tracker(period);
        let description = core.card.describe();
        let present = !core.card.is_absent();

        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            ring: EventRingBuffer::new(config.device.buffer_size)?,
            guard: ReentrancyGuard::new(),
            schedule_active: AtomicBool::new(false),
            state: AtomicU8::new(MeasurementState::New.as_u8()),
            period_ns: AtomicU64::new(u64::try_from(period.as_nanos()).unwrap_or(u64::MAX)),
            stopped: Signal::new(),
            data_ready: Signal::new(),
            reader_attached: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            limits: config.scheduler.rate_limits(),
            driver: config.scheduler.driver,
            clock_resolution,
        });

        let timer = match config.scheduler.driver {
            DriverKind::Thread => {
                let weak: Weak<Shared> = Arc::downgrade(&shared);
                Some(TimerThread::spawn("tdc-poll", move || {
                    let shared = weak.upgrade()?;
                    let outcome = shared.fire();
                    Some((outcome, shared.period()))
                })?)
            }
            DriverKind::Manual => None,
        };

        info!(
            device = %description,
            present,
            buffer = config.device.buffer_size,
            period = ?period,
            driver = ?config.scheduler.driver,
            "TDC device attached"
        );

        Ok(Self {
            shared,
            timer: Mutex::new(timer),
        })
    }

    // -------------------------------------------------------------------------
    // Poll schedule
    // -------------------------------------------------------------------------

    /// Run one poll firing. With the `manual` driver the caller calls this on its own
    /// schedule; the built-in timer thread calls it otherwise.
    pub fn fire(&self) -> FireOutcome {
        self.shared.fire()
    }

    /// Current poll period.
    pub fn period(&self) -> Duration {
        self.shared.period()
    }

    /// Whether a poll schedule is running.
    pub fn is_schedule_active(&self) -> bool {
        self.shared.schedule_active.load(Ordering::Acquire)
    }

    /// Set the poll period in nanoseconds, within the configured rate bounds.
    pub fn set_trigger_period_ns(&self, period_ns: u64) -> Result<()> {
        let period = self.shared.limits.check_period_ns(period_ns)?;
        self.set_period(period)
    }

    /// Set the poll rate in Hz, within the configured rate bounds.
    pub fn set_trigger_rate_hz(&self, rate_hz: u64) -> Result<()> {
        let period = self.shared.limits.period_for_rate(rate_hz)?;
        self.set_period(period)
    }

    fn set_period(&self, period: Duration) -> Result<()> {
        let shared = &self.shared;
        shared.exclusive(WaitPolicy::Block { timeout: Some(CONTROL_TIMEOUT) }, |core| {
            let nanos = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX);
            shared.period_ns.store(nanos, Ordering::Release);
            core.rebuild_tracker(period);
            info!(period = ?period, rate_hz = rate_for_period(period), "Poll period set");
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Measurement lifecycle
    // -------------------------------------------------------------------------

    /// Current measurement state.
    pub fn state(&self) -> MeasurementState {
        self.shared.state()
    }

    /// Start or resume the measurement.
    ///
    /// `pulse_limit` replaces the limit (0 = unlimited); `None` keeps the current one.
    /// From `Stopped` the measurement and the event buffer are reset first. Fails with
    /// `AlreadyRunning`, changing nothing, if the measurement is running.
    pub fn start(&self, pulse_limit: Option<u64>) -> Result<()> {
        let shared = &self.shared;
        shared.exclusive(WaitPolicy::Block { timeout: Some(CONTROL_TIMEOUT) }, |core| {
            let was_stopped = core.measurement.state() == MeasurementState::Stopped;
            let kind = core.measurement.prepare_start()?;
            if was_stopped {
                core.cache.clear();
                core.tracker.reset();
                shared.ring.reset();
            }
            if let Some(limit) = pulse_limit {
                core.measurement.set_pulse_limit(limit);
            }
            if kind == StartKind::Fresh {
                core.card.setup()?;
            }
            core.card.arm()?;
            core.measurement.mark_started(kind, Instant::now());
            shared.schedule_active.store(true, Ordering::Release);
            Ok(())
        })?;

        if let Some(timer) = self.timer.lock().as_ref() {
            timer.kick(shared.period());
        }
        Ok(())
    }

    /// Pause a running measurement, keeping its duration and counters.
    pub fn pause(&self, policy: WaitPolicy) -> Result<()> {
        let shared = &self.shared;
        shared.exclusive(policy, |core| {
            core.measurement.pause(Instant::now())?;
            shared.halt(core);
            Ok(())
        })
    }

    /// Stop the measurement. A no-op from `New` or `Stopped`.
    pub fn stop(&self, policy: WaitPolicy) -> Result<()> {
        let shared = &self.shared;
        shared.exclusive(policy, |core| {
            core.measurement.stop(Instant::now());
            shared.halt(core);
            Ok(())
        })
    }

    /// Zero the counters, empty the cache and the event buffer, and return to `New`.
    ///
    /// Fails with `Busy` while a firing is in flight.
    pub fn clear(&self) -> Result<()> {
        let shared = &self.shared;
        shared.exclusive(WaitPolicy::NonBlocking, |core| {
            core.measurement.reset();
            shared.halt(core);
            core.cache.clear();
            core.tracker.reset();
            shared.ring.reset();
            info!("Measurement data cleared");
            Ok(())
        })
    }

    /// Block until the measurement is stopped and its schedule has ended.
    pub fn wait_stopped(&self, timeout: Option<Duration>) -> Result<()> {
        let shared = &self.shared;
        match shared.stopped.wait_until(|| shared.end_of_data(), timeout) {
            WaitOutcome::Satisfied => Ok(()),
            WaitOutcome::Interrupted => Err(TdcError::Interrupted {
                waiting_for: "measurement to stop",
            }),
            WaitOutcome::TimedOut => Err(TdcError::WaitTimedOut {
                waiting_for: "measurement to stop",
            }),
        }
    }

    /// Wake control callers blocked waiting for a firing; they return `Interrupted`.
    /// Calls that start waiting afterwards are not affected.
    pub fn interrupt_waiters(&self) {
        self.shared.stopped.interrupt();
    }

    // -------------------------------------------------------------------------
    // Configuration commands
    // -------------------------------------------------------------------------

    /// Current card settings.
    pub fn settings(&self) -> CardSettings {
        *self.shared.core.lock().card.settings()
    }

    /// Set the upper edge of the window and optionally the per-channel hit capacity.
    pub fn set_config(&self, max_delay: u32, max_hits_per_channel: Option<u32>) -> Result<()> {
        let t_max = u16::try_from(max_delay)
            .map_err(|_| TdcError::invalid(format!("max_delay {} exceeds 65535", max_delay)))?;
        let hits = max_hits_per_channel
            .map(|h| {
                u8::try_from(h).map_err(|_| {
                    TdcError::invalid(format!("max_hits_per_channel {} out of range", h))
                })
            })
            .transpose()?;
        self.update_settings(|s| {
            s.t_max = t_max;
            if let Some(hits) = hits {
                s.max_hits_per_channel = hits;
            }
        })
    }

    /// Set the acceptance window; `0 <= t_min <= t_max <= 65535`.
    pub fn set_time_range(&self, t_min: u32, t_max: u32) -> Result<()> {
        if t_min > t_max || t_max > u32::from(u16::MAX) {
            return Err(TdcError::invalid(format!(
                "time range [{}, {}] invalid, need 0 <= t_min <= t_max <= 65535",
                t_min, t_max
            )));
        }
        // Both fit in u16 after the check above.
        let (t_min, t_max) = (t_min as u16, t_max as u16);
        self.update_settings(|s| {
            s.t_min = t_min;
            s.t_max = t_max;
        })
    }

    /// Select common-start or common-stop operation.
    pub fn set_com_mode(&self, mode: ComMode) -> Result<()> {
        self.update_settings(|s| s.com_mode = mode)
    }

    fn update_settings(&self, change: impl FnOnce(&mut CardSettings)) -> Result<()> {
        self.shared
            .exclusive(WaitPolicy::Block { timeout: Some(CONTROL_TIMEOUT) }, |core| {
                let mut settings = *core.card.settings();
                change(&mut settings);
                core.apply_settings(settings)?;
                info!(
                    t_min = settings.t_min,
                    t_max = settings.t_max,
                    hits = settings.max_hits_per_channel,
                    mode = %settings.com_mode,
                    "Card settings updated"
                );
                Ok(())
            })
    }

    // -------------------------------------------------------------------------
    // Consumer and status
    // -------------------------------------------------------------------------

    /// Attach the consumer. Only one reader may be attached at a time.
    pub fn reader(&self) -> Result<EventReader> {
        if self
            .shared
            .reader_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TdcError::busy("an event reader is already attached"));
        }
        Ok(EventReader {
            shared: Arc::clone(&self.shared),
            decoder: EventDecoder::new(),
        })
    }

    /// Wake a reader blocked in [`EventReader::read`]; it returns `Interrupted`.
    /// A later read is not affected.
    pub fn interrupt_reader(&self) {
        self.shared.data_ready.interrupt();
    }

    /// Bytes waiting in the event buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.ring.available_bytes()
    }

    /// Point-in-time status.
    pub fn snapshot(&self) -> StatusSnapshot {
        let shared = &self.shared;
        let core = shared.core.lock();
        let settings = *core.card.settings();
        let faults = core.card.faults() | core.measurement.faults();
        let period = shared.period();
        StatusSnapshot {
            device: core.card.describe(),
            card_present: !core.card.is_absent(),
            clock_resolution_ns: u64::try_from(shared.clock_resolution.as_nanos())
                .unwrap_or(u64::MAX),
            driver: shared.driver,
            trigger_rate_hz: rate_for_period(period),
            trigger_period_ns: u64::try_from(period.as_nanos()).unwrap_or(u64::MAX),
            schedule_active: shared.schedule_active.load(Ordering::Acquire),
            t_min: settings.t_min,
            t_max: settings.t_max,
            channel_count: settings.channel_count,
            max_hits_per_channel: settings.max_hits_per_channel,
            com_mode: settings.com_mode,
            buffer: BufferStatus {
                capacity: shared.ring.capacity(),
                used: shared.ring.available_bytes(),
                free: shared.ring.free_bytes(),
            },
            state: core.measurement.state(),
            duration_secs: core.measurement.elapsed(Instant::now()).as_secs_f64(),
            pulse_limit: core.measurement.pulse_limit(),
            error_code: faults.bits(),
            faults: fault_names(faults),
            rates: core.measurement.rates(),
            counters: core.measurement.counters().clone(),
            reader_attached: shared.reader_attached.load(Ordering::Acquire),
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Stop the measurement, clear its data, disarm the card and join the timer thread.
    pub fn detach(self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&self) -> Result<()> {
        if self.shared.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let shared = &self.shared;
        let stopped = self.stop(WaitPolicy::Block {
            timeout: Some(CONTROL_TIMEOUT),
        });
        if let Some(mut timer) = self.timer.lock().take() {
            timer.shutdown();
        }
        let cleared = shared.exclusive(
            WaitPolicy::Block {
                timeout: Some(CONTROL_TIMEOUT),
            },
            |core| {
                core.measurement.reset();
                core.cache.clear();
                shared.ring.reset();
                core.disarm_if_armed();
                shared.schedule_active.store(false, Ordering::Release);
                Ok(())
            },
        );
        info!(device = %shared.core.lock().card.describe(), "TDC device detached");
        stopped.and(cleared)
    }
}

impl Drop for TdcDevice {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(error = %e, "TDC device teardown incomplete");
        }
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// The single consumer of the event stream. Dropping it lets another reader attach.
#[derive(Debug)]
pub struct EventReader {
    shared: Arc<Shared>,
    decoder: EventDecoder,
}

impl EventReader {
    /// Block until event bytes are available and copy them into `buf`.
    ///
    /// Returns `Ok(0)` at end of data: the measurement is stopped, its schedule has
    /// ended and the buffer is drained.
    pub fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let shared = &self.shared;
        let outcome =
            shared
                .data_ready
                .wait_until(|| !shared.ring.is_empty() || shared.end_of_data(), timeout);
        match outcome {
            WaitOutcome::Satisfied => Ok(shared.ring.read_into(buf)),
            WaitOutcome::Interrupted => Err(TdcError::Interrupted {
                waiting_for: "event data",
            }),
            WaitOutcome::TimedOut => Err(TdcError::WaitTimedOut {
                waiting_for: "event data",
            }),
        }
    }

    /// Copy whatever is buffered without waiting.
    ///
    /// `Busy` means no data yet while more may come; `Ok(0)` is end of data.
    pub fn try_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let shared = &self.shared;
        if !shared.ring.is_empty() {
            return Ok(shared.ring.read_into(buf));
        }
        if shared.end_of_data() || buf.is_empty() {
            return Ok(0);
        }
        Err(TdcError::busy("no event data available"))
    }

    /// Block until one complete event is available. `None` is end of data.
    pub fn read_event(&mut self, timeout: Option<Duration>) -> Result<Option<EventRecord>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(event) = self.decoder.next_event() {
                return Ok(Some(event));
            }
            let n = self.read(&mut chunk, timeout)?;
            if n == 0 {
                if self.decoder.pending_bytes() > 0 {
                    warn!(
                        pending = self.decoder.pending_bytes(),
                        "Event stream ended inside a record"
                    );
                }
                return Ok(None);
            }
            self.decoder.extend(&chunk[..n]);
        }
    }
}

impl Drop for EventReader {
    fn drop(&mut self) {
        self.shared.reader_attached.store(false, Ordering::Release);
    }
}
