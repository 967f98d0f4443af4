//! Statistics Aggregator: rates from monotonic counters.

use std::time::Duration;

use super::measurement::Rates;

/// Samples the pulse and hit counters once per window of firings.
///
/// The window spans `window_firings * period` of nominal schedule time; rates are the
/// counter deltas over that span.
#[derive(Debug, Clone)]
pub struct RateTracker {
    window_firings: u64,
    window: Duration,
    firings: u64,
    last_pulses: u64,
    last_hits: u64,
}

impl RateTracker {
    /// Sample every `window_firings` firings of a schedule with the given period.
    pub fn new(window_firings: u64, period: Duration) -> Self {
        let window_firings = window_firings.max(1);
        Self {
            window_firings,
            window: period.saturating_mul(u32::try_from(window_firings).unwrap_or(u32::MAX)),
            firings: 0,
            last_pulses: 0,
            last_hits: 0,
        }
    }

    /// Count one firing; returns fresh rates when a window completes.
    pub fn tick(&mut self, pulses: u64, valid_hits: u64) -> Option<Rates> {
        self.firings += 1;
        if self.firings < self.window_firings {
            return None;
        }
        self.firings = 0;

        let secs = self.window.as_secs_f64();
        let pulse_delta = pulses.saturating_sub(self.last_pulses);
        let hit_delta = valid_hits.saturating_sub(self.last_hits);
        self.last_pulses = pulses;
        self.last_hits = valid_hits;

        if secs <= 0.0 {
            return Some(Rates::default());
        }
        Some(Rates {
            pulse_rate_hz: pulse_delta as f64 / secs,
            hit_rate_hz: hit_delta as f64 / secs,
        })
    }

    /// Forget previous samples, e.g. after the counters were reset.
    pub fn reset(&mut self) {
        self.firings = 0;
        self.last_pulses = 0;
        self.last_hits = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_once_per_window() {
        // 10 firings of 100 ms = 1 s window
        let mut tracker = RateTracker::new(10, Duration::from_millis(100));
        for i in 0..9 {
            assert!(tracker.tick(i, i * 2).is_none());
        }
        let rates = tracker.tick(50, 120).unwrap();
        assert!((rates.pulse_rate_hz - 50.0).abs() < 1e-9);
        assert!((rates.hit_rate_hz - 120.0).abs() < 1e-9);

        for _ in 0..9 {
            assert!(tracker.tick(60, 130).is_none());
        }
        let rates = tracker.tick(60, 130).unwrap();
        assert!((rates.pulse_rate_hz - 10.0).abs() < 1e-9);
        assert!((rates.hit_rate_hz - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_counter_reset_does_not_underflow() {
        let mut tracker = RateTracker::new(1, Duration::from_millis(500));
        tracker.tick(100, 100).unwrap();
        let rates = tracker.tick(0, 0).unwrap();
        assert_eq!(rates.pulse_rate_hz, 0.0);

        tracker.reset();
        let rates = tracker.tick(4, 2).unwrap();
        assert!((rates.pulse_rate_hz - 8.0).abs() < 1e-9);
        assert!((rates.hit_rate_hz - 4.0).abs() < 1e-9);
    }
}
