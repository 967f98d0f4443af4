//! Point-in-time status of the device.
//!
//! A [`StatusSnapshot`] is a plain copy taken under the device lock; holding one does
//! not block acquisition. It serializes to JSON for the CLI and renders as a short
//! text report through `Display`.

use std::fmt;

use serde::Serialize;

use crate::acquisition::measurement::{MeasurementCounters, MeasurementState, Rates};
use crate::acquisition::scheduler::DriverKind;
use crate::hardware::{ComMode, FaultFlags};

/// Ring buffer occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferStatus {
    /// Size in bytes.
    pub capacity: usize,
    /// Bytes waiting for the consumer.
    pub used: usize,
    /// Bytes a producer may still write.
    pub free: usize,
}

/// Read-only snapshot of configuration, state and counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Port backend description.
    pub device: String,
    /// Whether the attach probe found a card.
    pub card_present: bool,
    /// Monotonic clock resolution, ns.
    pub clock_resolution_ns: u64,
    /// Poll driver.
    pub driver: DriverKind,
    /// Configured poll rate, Hz.
    pub trigger_rate_hz: u64,
    /// Configured poll period, ns.
    pub trigger_period_ns: u64,
    /// Whether a poll schedule is running.
    pub schedule_active: bool,
    /// Acceptance window lower edge, 0.5 ns units.
    pub t_min: u16,
    /// Acceptance window upper edge, 0.5 ns units.
    pub t_max: u16,
    /// Channels in use.
    pub channel_count: u8,
    /// Hits kept per channel and event.
    pub max_hits_per_channel: u8,
    /// Timing mode.
    pub com_mode: ComMode,
    /// Event buffer occupancy.
    pub buffer: BufferStatus,
    /// Measurement state.
    pub state: MeasurementState,
    /// Cumulative measurement time, seconds.
    pub duration_secs: f64,
    /// Pulse limit, 0 for none.
    pub pulse_limit: u64,
    /// Fault bits of device and measurement combined; 0 means no error.
    pub error_code: u32,
    /// Names of the set fault bits.
    pub faults: Vec<&'static str>,
    /// Rates from the last sampling window.
    pub rates: Rates,
    /// Measurement counters, including overflow and multiplicity.
    pub counters: MeasurementCounters,
    /// Whether a consumer is attached.
    pub reader_attached: bool,
}

/// Names of the bits set in `faults`.
pub fn fault_names(faults: FaultFlags) -> Vec<&'static str> {
    faults.iter_names().map(|(name, _)| name).collect()
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "device: {}", self.device)?;
        if !self.card_present {
            writeln!(f, "card: NOT DETECTED")?;
        }
        writeln!(f, "clock resolution: {} ns", self.clock_resolution_ns)?;
        writeln!(
            f,
            "poll rate: {} Hz ({} ns, {:?} driver{})",
            self.trigger_rate_hz,
            self.trigger_period_ns,
            self.driver,
            if self.schedule_active { ", active" } else { "" }
        )?;
        writeln!(
            f,
            "window: [{}, {}], {} channels x {} hits, {}",
            self.t_min, self.t_max, self.channel_count, self.max_hits_per_channel, self.com_mode
        )?;
        writeln!(
            f,
            "buffer: {} / {} bytes used",
            self.buffer.used,
            self.buffer.capacity - 1
        )?;
        writeln!(
            f,
            "measurement: {} for {:.3} s, limit {}",
            self.state, self.duration_secs, self.pulse_limit
        )?;
        if self.error_code != 0 {
            writeln!(f, "error: {} ({})", self.error_code, self.faults.join(", "))?;
        }
        writeln!(
            f,
            "rates: {:.1} pulses/s, {:.1} hits/s",
            self.rates.pulse_rate_hz, self.rates.hit_rate_hz
        )?;

        let c = &self.counters;
        writeln!(
            f,
            "pulses: {} ({} without hits), hits: {} ({} valid, {} dropped)",
            c.pulses, c.pulses_without_hits, c.total_hits, c.valid_hits_sum, c.dropped_hits
        )?;
        writeln!(
            f,
            "overflow: {} times, {} events, {} hits",
            c.overflow.occurrences, c.overflow.events, c.overflow.hits
        )?;
        for (channel, row) in c.multiplicity.iter().enumerate() {
            let valid = c.valid_hits.get(channel).copied().unwrap_or(0);
            let invalid = c.invalid_hits.get(channel).copied().unwrap_or(0);
            write!(f, "ch{}: {} valid, {} invalid, multiplicity", channel, valid, invalid)?;
            for count in row.iter().skip(1).take(usize::from(self.max_hits_per_channel)) {
                write!(f, " {}", count)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_names() {
        assert!(fault_names(FaultFlags::empty()).is_empty());
        assert_eq!(
            fault_names(FaultFlags::NO_CARD | FaultFlags::TOO_MANY_EVENTS),
            vec!["NO_CARD", "TOO_MANY_EVENTS"]
        );
    }
}
