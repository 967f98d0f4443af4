//! Measurement lifecycle and counters.
//!
//! ```text
//!            start                pause
//!   New ───────────► Started ───────────► Paused
//!    ▲                 │  ▲                 │
//!    │                 │  └─────start───────┘
//!    │ reset      stop │                    │ stop
//!    │                 ▼                    │
//!    └──────────── Stopped ◄────────────────┘
//! ```
//!
//! `start` from `Stopped` resets implicitly. Only the transitions and the bookkeeping
//! live here; the device performs the matching hardware and scheduler actions.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use super::cache::EventCache;
use crate::error::{Result, TdcError};
use crate::hardware::registers::MAX_HITS_PER_CHANNEL;
use crate::hardware::FaultFlags;

/// Lifecycle state of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MeasurementState {
    /// Reset, nothing recorded.
    New = 0,
    /// Polling the card.
    Started = 1,
    /// Suspended; duration is kept.
    Paused = 2,
    /// Finished; only a reset or a new start leaves this state.
    Stopped = 3,
}

impl MeasurementState {
    /// Compact representation for atomic mirrors.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`as_u8`](Self::as_u8). Unknown values map to `Stopped`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Started,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What `start` has to do to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    /// A new measurement: full setup, duration zeroed.
    Fresh,
    /// Resuming from `Paused`: accumulated duration kept.
    Resume,
}

/// Ring buffer overflow accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OverflowCounters {
    /// Times a push was rejected.
    pub occurrences: u64,
    /// Events discarded.
    pub events: u64,
    /// Hits discarded with those events.
    pub hits: u64,
}

/// Instantaneous rates from the last sampling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Rates {
    /// Reference pulses per second.
    pub pulse_rate_hz: f64,
    /// In-window hits per second.
    pub hit_rate_hz: f64,
}

/// Hits seen for the given number of hits per channel per event.
pub type MultiplicityRow = [u64; MAX_HITS_PER_CHANNEL as usize + 1];

/// Monotonic counters of one measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementCounters {
    /// Reference pulses recorded.
    pub pulses: u64,
    /// Reference pulses whose latch showed no data.
    pub pulses_without_hits: u64,
    /// Every hit read from the card.
    pub total_hits: u64,
    /// In-window hits per channel.
    pub valid_hits: Vec<u64>,
    /// Out-of-window hits per channel.
    pub invalid_hits: Vec<u64>,
    /// Sum of `valid_hits`.
    pub valid_hits_sum: u64,
    /// Hits dropped because their channel was full or unknown.
    pub dropped_hits: u64,
    /// `multiplicity[ch][n]`: events in which channel `ch` carried exactly `n` hits.
    pub multiplicity: Vec<MultiplicityRow>,
    /// Ring buffer overflow accounting.
    pub overflow: OverflowCounters,
}

impl MeasurementCounters {
    fn new(channel_count: usize) -> Self {
        Self {
            pulses: 0,
            pulses_without_hits: 0,
            total_hits: 0,
            valid_hits: vec![0; channel_count],
            invalid_hits: vec![0; channel_count],
            valid_hits_sum: 0,
            dropped_hits: 0,
            multiplicity: vec![[0; MAX_HITS_PER_CHANNEL as usize + 1]; channel_count],
            overflow: OverflowCounters::default(),
        }
    }

    /// Record the per-channel hit counts of a flushed event.
    pub fn record_multiplicity(&mut self, cache: &EventCache) {
        for (channel, count) in cache.per_channel() {
            if count == 0 {
                continue;
            }
            if let Some(slot) = self
                .multiplicity
                .get_mut(channel)
                .and_then(|row| row.get_mut(count))
            {
                *slot += 1;
            }
        }
    }

    /// Account for an event the ring buffer rejected.
    pub fn record_overflow(&mut self, hits: usize) {
        self.overflow.occurrences += 1;
        self.overflow.events += 1;
        self.overflow.hits += hits as u64;
    }
}

/// One acquisition session.
#[derive(Debug, Clone)]
pub struct Measurement {
    state: MeasurementState,
    duration: Duration,
    started_at: Option<Instant>,
    pulse_limit: u64,
    counters: MeasurementCounters,
    faults: FaultFlags,
    rates: Rates,
}

impl Measurement {
    /// A new measurement for `channel_count` channels.
    pub fn new(channel_count: usize) -> Self {
        Self {
            state: MeasurementState::New,
            duration: Duration::ZERO,
            started_at: None,
            pulse_limit: 0,
            counters: MeasurementCounters::new(channel_count),
            faults: FaultFlags::empty(),
            rates: Rates::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> MeasurementState {
        self.state
    }

    /// Counters.
    pub fn counters(&self) -> &MeasurementCounters {
        &self.counters
    }

    /// Counters, for the poll path.
    pub fn counters_mut(&mut self) -> &mut MeasurementCounters {
        &mut self.counters
    }

    /// Sticky faults of this measurement.
    pub fn faults(&self) -> FaultFlags {
        self.faults
    }

    /// Raise a sticky fault.
    pub fn raise(&mut self, fault: FaultFlags) {
        self.faults |= fault;
    }

    /// Set or clear a live (non-sticky) fault such as `NO_COM`.
    pub fn set_fault(&mut self, fault: FaultFlags, active: bool) {
        self.faults.set(fault, active);
    }

    /// Rates from the last sampling window.
    pub fn rates(&self) -> Rates {
        self.rates
    }

    /// Publish new rates.
    pub fn set_rates(&mut self, rates: Rates) {
        self.rates = rates;
    }

    /// Reference pulses to record before stopping; 0 is unlimited.
    pub fn pulse_limit(&self) -> u64 {
        self.pulse_limit
    }

    /// Set the pulse limit; 0 is unlimited.
    pub fn set_pulse_limit(&mut self, limit: u64) {
        self.pulse_limit = limit;
    }

    /// Whether the configured pulse limit has been reached.
    pub fn limit_reached(&self) -> bool {
        self.pulse_limit != 0 && self.counters.pulses >= self.pulse_limit
    }

    /// Cumulative duration, including the running stretch if started.
    pub fn elapsed(&self, now: Instant) -> Duration {
        match self.started_at {
            Some(started) => self.duration + now.saturating_duration_since(started),
            None => self.duration,
        }
    }

    /// First half of `start`: validate and reset if needed. The state is not changed
    /// until [`mark_started`](Self::mark_started).
    pub fn prepare_start(&mut self) -> Result<StartKind> {
        match self.state {
            MeasurementState::Started => Err(TdcError::AlreadyRunning),
            MeasurementState::Stopped => {
                self.reset();
                Ok(StartKind::Fresh)
            }
            MeasurementState::New => Ok(StartKind::Fresh),
            MeasurementState::Paused => Ok(StartKind::Resume),
        }
    }

    /// Second half of `start`, after the hardware has been armed.
    pub fn mark_started(&mut self, kind: StartKind, now: Instant) {
        if kind == StartKind::Fresh {
            self.duration = Duration::ZERO;
        }
        self.started_at = Some(now);
        self.state = MeasurementState::Started;
        info!(?kind, limit = self.pulse_limit, "Measurement started");
    }

    /// `Started -> Paused`, accumulating the running time.
    pub fn pause(&mut self, now: Instant) -> Result<()> {
        if self.state != MeasurementState::Started {
            return Err(TdcError::InvalidState {
                operation: "pause",
                state: self.state,
            });
        }
        self.accumulate(now);
        self.state = MeasurementState::Paused;
        info!(duration = ?self.duration, "Measurement paused");
        Ok(())
    }

    /// `Started | Paused -> Stopped`. Returns false, changing nothing, from any other
    /// state.
    pub fn stop(&mut self, now: Instant) -> bool {
        match self.state {
            MeasurementState::Started | MeasurementState::Paused => {
                self.accumulate(now);
                self.state = MeasurementState::Stopped;
                info!(
                    duration = ?self.duration,
                    pulses = self.counters.pulses,
                    hits = self.counters.total_hits,
                    "Measurement stopped"
                );
                true
            }
            MeasurementState::New | MeasurementState::Stopped => false,
        }
    }

    /// Zero everything and return to `New`. The pulse limit is cleared too.
    pub fn reset(&mut self) {
        let channels = self.counters.valid_hits.len();
        *self = Self::new(channels);
        debug!("Measurement reset");
    }

    fn accumulate(&mut self, now: Instant) {
        if let Some(started) = self.started_at.take() {
            self.duration += now.saturating_duration_since(started);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(m: &mut Measurement, now: Instant) {
        let kind = m.prepare_start().unwrap();
        m.mark_started(kind, now);
    }

    #[test]
    fn test_start_from_started_fails_without_side_effect() {
        let mut m = Measurement::new(8);
        let t0 = Instant::now();
        started(&mut m, t0);
        m.counters_mut().pulses = 3;

        assert!(matches!(m.prepare_start(), Err(TdcError::AlreadyRunning)));
        assert_eq!(m.state(), MeasurementState::Started);
        assert_eq!(m.counters().pulses, 3);
    }

    #[test]
    fn test_start_from_stopped_resets_counters() {
        let mut m = Measurement::new(8);
        let t0 = Instant::now();
        started(&mut m, t0);
        m.counters_mut().pulses = 10;
        m.counters_mut().valid_hits[0] = 4;
        m.raise(FaultFlags::TOO_MANY_HITS);
        assert!(m.stop(t0 + Duration::from_secs(1)));

        assert_eq!(m.prepare_start().unwrap(), StartKind::Fresh);
        assert_eq!(m.counters().pulses, 0);
        assert_eq!(m.counters().valid_hits[0], 0);
        assert!(m.faults().is_empty());
        m.mark_started(StartKind::Fresh, t0 + Duration::from_secs(2));
        assert_eq!(m.state(), MeasurementState::Started);
        assert_eq!(m.elapsed(t0 + Duration::from_secs(2)), Duration::ZERO);
    }

    #[test]
    fn test_pause_resume_preserves_duration() {
        let mut m = Measurement::new(8);
        let t0 = Instant::now();
        started(&mut m, t0);
        m.pause(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(m.elapsed(t0 + Duration::from_secs(100)), Duration::from_secs(2));

        assert_eq!(m.prepare_start().unwrap(), StartKind::Resume);
        m.mark_started(StartKind::Resume, t0 + Duration::from_secs(10));
        assert!(m.stop(t0 + Duration::from_secs(13)));
        assert_eq!(m.elapsed(t0 + Duration::from_secs(50)), Duration::from_secs(5));
    }

    #[test]
    fn test_stop_from_paused_does_not_double_count() {
        let mut m = Measurement::new(8);
        let t0 = Instant::now();
        started(&mut m, t0);
        m.pause(t0 + Duration::from_secs(1)).unwrap();
        assert!(m.stop(t0 + Duration::from_secs(5)));
        assert_eq!(m.elapsed(t0 + Duration::from_secs(9)), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut m = Measurement::new(8);
        let now = Instant::now();
        assert!(matches!(
            m.pause(now),
            Err(TdcError::InvalidState {
                operation: "pause",
                state: MeasurementState::New
            })
        ));
        assert!(!m.stop(now));
        assert_eq!(m.state(), MeasurementState::New);
    }

    #[test]
    fn test_pulse_limit() {
        let mut m = Measurement::new(8);
        assert!(!m.limit_reached());
        m.set_pulse_limit(2);
        m.counters_mut().pulses = 2;
        assert!(m.limit_reached());
        m.reset();
        assert_eq!(m.pulse_limit(), 0);
    }

    #[test]
    fn test_multiplicity_and_overflow_accounting() {
        let mut m = Measurement::new(2);
        let mut cache = EventCache::new(2, 16);
        cache.accept(0, 1);
        cache.accept(0, 2);
        cache.accept(1, 3);
        m.counters_mut().record_multiplicity(&cache);
        m.counters_mut().record_overflow(3);

        let c = m.counters();
        assert_eq!(c.multiplicity[0][2], 1);
        assert_eq!(c.multiplicity[1][1], 1);
        assert_eq!(c.multiplicity[0][0], 0);
        assert_eq!(
            c.overflow,
            OverflowCounters {
                occurrences: 1,
                events: 1,
                hits: 3
            }
        );
    }

    #[test]
    fn test_state_u8_round_trip() {
        for state in [
            MeasurementState::New,
            MeasurementState::Started,
            MeasurementState::Paused,
            MeasurementState::Stopped,
        ] {
            assert_eq!(MeasurementState::from_u8(state.as_u8()), state);
        }
    }
}
