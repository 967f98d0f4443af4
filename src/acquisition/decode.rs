//! Decode Engine: read the hits of one reference pulse, classify them and flush the
//! event into the ring buffer.

use std::time::Duration;

use tracing::{debug, trace, warn};

use super::cache::EventCache;
use super::measurement::Measurement;
use crate::data::event;
use crate::data::EventRingBuffer;
use crate::error::{Result, TdcError};
use crate::hardware::{FaultFlags, TdcCard};

/// What happened to the flushed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Written to the ring buffer.
    Written {
        /// Record size in bytes.
        bytes: usize,
    },
    /// Not enough free space; the event was discarded and accounted.
    Overflow {
        /// Record size in bytes.
        needed: usize,
        /// Free space at the time of the push.
        free: usize,
    },
    /// The buffer lock was not obtained in time; the event was discarded and accounted.
    Busy,
    /// More hits than one record can carry; the event was discarded and its hits
    /// counted as dropped.
    TooLarge {
        /// Hits in the event.
        hits: usize,
    },
}

/// Summary of one decoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeReport {
    /// Hits read from the card.
    pub read: usize,
    /// Hits stored in the event.
    pub accepted: usize,
    /// Hits dropped for capacity or an unknown channel.
    pub dropped: usize,
    /// Whether reading was cut short by the too-many-hits limit.
    pub aborted: bool,
    /// Per-event hit limit that was in force.
    pub limit: usize,
    /// Fate of the event record.
    pub flush: FlushOutcome,
}

impl DecodeReport {
    /// The data loss this event suffered, if any, as an error for reporting.
    pub fn loss(&self) -> Option<TdcError> {
        if self.aborted {
            return Some(TdcError::TooManyHits {
                dropped: self.dropped,
                limit: self.limit,
            });
        }
        match self.flush {
            FlushOutcome::Written { .. } => None,
            FlushOutcome::Overflow { needed, free } => Some(TdcError::Overflow { needed, free }),
            FlushOutcome::Busy => Some(TdcError::busy("event buffer lock timed out")),
            FlushOutcome::TooLarge { hits } => Some(TdcError::TooManyHits {
                dropped: hits,
                limit: event::MAX_EVENT_HITS,
            }),
        }
    }
}

/// Turns card readouts into event records.
#[derive(Debug)]
pub struct DecodeEngine {
    scratch: Vec<u8>,
    lock_timeout: Duration,
}

impl DecodeEngine {
    /// `lock_timeout` bounds the wait for the ring buffer lock when flushing.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            scratch: Vec::with_capacity(event::encoded_len(event::MAX_EVENT_HITS)),
            lock_timeout,
        }
    }

    /// Read hits until the card reports none pending, then flush the cache.
    ///
    /// The card must have reported pending hits from `poll_for_hits`. The cache is
    /// empty on return, whatever happened. A port error ends the readout early; the
    /// hits read so far are flushed before the error is returned.
    pub fn decode_event(
        &mut self,
        card: &mut TdcCard,
        cache: &mut EventCache,
        measurement: &mut Measurement,
        ring: &EventRingBuffer,
    ) -> Result<DecodeReport> {
        let settings = *card.settings();
        let limit = settings.event_capacity();
        let mut read = 0usize;
        let mut dropped = 0usize;
        let mut aborted = false;
        let mut failure = None;

        let mut more = true;
        while more {
            let readout = match card.read_next_hit() {
                Ok(readout) => readout,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            more = readout.more;
            let hit = readout.hit;
            let channel = usize::from(hit.channel);
            read += 1;

            let counters = measurement.counters_mut();
            counters.total_hits += 1;

            if cache.has_room(channel) {
                if settings.in_window(hit.delay) {
                    counters.valid_hits[channel] += 1;
                    counters.valid_hits_sum += 1;
                } else {
                    trace!(channel, delay = hit.delay, "Hit outside acceptance window");
                    counters.invalid_hits[channel] += 1;
                }
                cache.accept(channel, hit.delay);
            } else {
                dropped += 1;
                counters.dropped_hits += 1;
                trace!(channel, accepted = cache.accepted(channel), "Channel full, hit dropped");
                if dropped > limit {
                    warn!(dropped, limit, "Too many hits for one reference pulse");
                    measurement.raise(FaultFlags::TOO_MANY_HITS);
                    card.raise(FaultFlags::TOO_MANY_HITS);
                    aborted = true;
                    break;
                }
            }
        }

        let accepted = cache.total();
        let flush = self.flush(cache, measurement, ring);
        cache.clear();

        if let Some(e) = failure {
            return Err(e);
        }

        Ok(DecodeReport {
            read,
            accepted,
            dropped,
            aborted,
            limit,
            flush,
        })
    }

    fn flush(
        &mut self,
        cache: &EventCache,
        measurement: &mut Measurement,
        ring: &EventRingBuffer,
    ) -> FlushOutcome {
        self.scratch.clear();
        if let Err(e) = event::encode_hits(cache.hits(), &mut self.scratch) {
            warn!(error = %e, "Could not encode event");
            measurement.counters_mut().dropped_hits += cache.total() as u64;
            measurement.raise(FaultFlags::TOO_MANY_HITS);
            return FlushOutcome::TooLarge {
                hits: cache.total(),
            };
        }

        match ring.push_record(&self.scratch, self.lock_timeout) {
            Ok(()) => {
                measurement.counters_mut().record_multiplicity(cache);
                FlushOutcome::Written {
                    bytes: self.scratch.len(),
                }
            }
            Err(TdcError::Overflow { needed, free }) => {
                debug!(needed, free, hits = cache.total(), "Event buffer full, event dropped");
                measurement.counters_mut().record_overflow(cache.total());
                measurement.raise(FaultFlags::TOO_MANY_EVENTS);
                FlushOutcome::Overflow { needed, free }
            }
            Err(e) => {
                debug!(error = %e, hits = cache.total(), "Event buffer busy, event dropped");
                measurement.counters_mut().record_overflow(cache.total());
                FlushOutcome::Busy
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{CardSettings, MockTdcCard};

    const LOCK: Duration = Duration::from_millis(10);

    struct Rig {
        mock: MockTdcCard,
        card: TdcCard,
        cache: EventCache,
        measurement: Measurement,
        ring: EventRingBuffer,
        engine: DecodeEngine,
    }

    fn rig(settings: CardSettings, ring_size: usize) -> Rig {
        let mock = MockTdcCard::new();
        let mut card = TdcCard::new(Box::new(mock.clone()), settings);
        card.setup().unwrap();
        Rig {
            mock,
            card,
            cache: EventCache::new(
                usize::from(settings.channel_count),
                usize::from(settings.max_hits_per_channel),
            ),
            measurement: Measurement::new(usize::from(settings.channel_count)),
            ring: EventRingBuffer::new(ring_size).unwrap(),
            engine: DecodeEngine::new(LOCK),
        }
    }

    impl Rig {
        fn pulse(&mut self, hits: &[(u8, u16)]) -> DecodeReport {
            self.mock.push_pulse(hits);
            self.card.arm().unwrap();
            assert!(self.card.has_reference_pulse().unwrap());
            assert!(self.card.poll_for_hits().unwrap());
            let report = self
                .engine
                .decode_event(
                    &mut self.card,
                    &mut self.cache,
                    &mut self.measurement,
                    &self.ring,
                )
                .unwrap();
            self.card.disarm().unwrap();
            report
        }

        fn drain(&self) -> Vec<u8> {
            let mut out = vec![0u8; self.ring.available_bytes()];
            let n = self.ring.read_into(&mut out);
            out.truncate(n);
            out
        }
    }

    #[test]
    fn test_valid_and_invalid_hits() {
        let settings = CardSettings {
            t_min: 0,
            t_max: 1000,
            ..CardSettings::default()
        };
        let mut rig = rig(settings, 1024);
        let report = rig.pulse(&[(0, 500), (0, 1500)]);

        assert_eq!(report.read, 2);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.flush, FlushOutcome::Written { bytes: 7 });
        assert!(report.loss().is_none());

        let c = rig.measurement.counters();
        assert_eq!(c.valid_hits[0], 1);
        assert_eq!(c.invalid_hits[0], 1);
        assert_eq!(c.valid_hits_sum, 1);
        assert_eq!(c.total_hits, 2);
        assert_eq!(c.multiplicity[0][2], 1);
        assert_eq!(rig.drain(), vec![0x02, 0x00, 0x01, 0xF4, 0x00, 0x05, 0xDC]);
        assert!(rig.cache.is_empty());
    }

    #[test]
    fn test_per_channel_capacity_bounds_counters() {
        let settings = CardSettings {
            max_hits_per_channel: 2,
            channel_count: 2,
            t_max: 100,
            ..CardSettings::default()
        };
        let mut rig = rig(settings, 1024);
        let report = rig.pulse(&[(0, 1), (0, 200), (0, 3), (0, 4), (1, 5)]);

        assert_eq!(report.accepted, 3);
        assert_eq!(report.dropped, 2);
        assert!(!report.aborted);

        let c = rig.measurement.counters();
        for ch in 0..2 {
            assert!(c.valid_hits[ch] + c.invalid_hits[ch] <= 2);
        }
        assert_eq!(c.valid_hits[0], 1);
        assert_eq!(c.invalid_hits[0], 1);
        assert_eq!(c.dropped_hits, 2);
        assert_eq!(c.total_hits, 5);
    }

    #[test]
    fn test_too_many_hits_aborts_and_flushes() {
        let settings = CardSettings {
            max_hits_per_channel: 1,
            channel_count: 2,
            ..CardSettings::default()
        };
        let mut rig = rig(settings, 1024);
        // limit = 2; the third dropped hit trips it
        let hits: Vec<(u8, u16)> = (0..10).map(|i| (0, i)).collect();
        let report = rig.pulse(&hits);

        assert!(report.aborted);
        assert_eq!(report.read, 4);
        assert_eq!(report.dropped, 3);
        assert!(matches!(report.loss(), Some(TdcError::TooManyHits { dropped: 3, limit: 2 })));
        assert!(rig.measurement.faults().contains(FaultFlags::TOO_MANY_HITS));
        assert!(rig.card.faults().contains(FaultFlags::TOO_MANY_HITS));
        assert_eq!(rig.drain(), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_overflow_is_accounted_and_buffer_untouched() {
        let mut rig = rig(CardSettings::default(), 8);
        rig.ring.push_record(&[0xEE; 4], LOCK).unwrap();

        let report = rig.pulse(&[(1, 10), (2, 20)]);
        assert_eq!(report.flush, FlushOutcome::Overflow { needed: 7, free: 3 });

        let c = rig.measurement.counters();
        assert_eq!(c.overflow.occurrences, 1);
        assert_eq!(c.overflow.events, 1);
        assert_eq!(c.overflow.hits, 2);
        assert_eq!(c.multiplicity[1][1], 0);
        assert!(rig.measurement.faults().contains(FaultFlags::TOO_MANY_EVENTS));
        assert_eq!(rig.drain(), vec![0xEE; 4]);
        assert!(rig.cache.is_empty());
    }

    #[test]
    fn test_unknown_channel_is_dropped() {
        let settings = CardSettings {
            channel_count: 4,
            ..CardSettings::default()
        };
        let mut rig = rig(settings, 1024);
        let report = rig.pulse(&[(6, 100), (1, 100)]);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(rig.measurement.counters().total_hits, 2);
        assert_eq!(rig.drain(), vec![1, 1, 0x00, 0x64]);
    }

    #[test]
    fn test_event_too_large_for_record_is_dropped() {
        let mut rig = rig(CardSettings::default(), 4096);
        let mut cache = EventCache::new(2, 200);
        for i in 0..300u16 {
            assert!(cache.accept(usize::from(i % 2), i));
        }

        let outcome = rig.engine.flush(&cache, &mut rig.measurement, &rig.ring);
        assert_eq!(outcome, FlushOutcome::TooLarge { hits: 300 });
        assert_eq!(rig.measurement.counters().dropped_hits, 300);
        assert_eq!(rig.measurement.counters().overflow.occurrences, 0);
        assert!(rig.measurement.faults().contains(FaultFlags::TOO_MANY_HITS));
        assert!(rig.ring.is_empty());
    }
}
