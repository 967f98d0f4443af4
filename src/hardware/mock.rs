//! Simulated TDC card.
//!
//! `MockTdcCard` implements [`PortIo`] by interpreting the control-port handshake the
//! way the MTD133B does, so the full poll/decode path runs unchanged without hardware.
//!
//! # Behaviour
//!
//! - Pulses are queued with [`push_pulse`](MockTdcCard::push_pulse) or produced by a
//!   random [`PulseGenerator`].
//! - A reset followed by Enable* low arms the chip. While armed and a pulse is queued,
//!   the status port reports the reference pulse.
//! - Three RCLK pulses followed by P.in* low latch the pulse's hits. Each RCLK with
//!   P.in* low shifts the next hit into the data ports; P.out* reports what remains.
//! - RCLK followed by P.in* high ends the readout, consumes the pulse and disarms.
//! - [`floating`](MockTdcCard::floating) models an empty ISA bus: every read is all ones.
//!
//! Clones share the same simulated card, so a test keeps one handle and gives another
//! to the device.
//!
//! # Example
//!
//! ```rust,ignore
//! let mock = MockTdcCard::new();
//! mock.push_pulse(&[(0, 500), (0, 1500)]);
//! let device = TdcDevice::attach(Box::new(mock.clone()), &config)?;
//! ```

use std::collections::VecDeque;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::card::Hit;
use super::port::PortIo;
use super::registers::{control, status, Port, PortWrite, LATCH_CLOCK_PULSES};
use crate::error::Result;

/// Word returned by the probe read of a populated card.
pub const PROBE_WORD: u32 = 0x0000_0203;

const WRITE_LOG_CAPACITY: usize = 4096;

/// Control bits that carry the handshake; mode bits are ignored by the simulation.
const HANDSHAKE_MASK: u8 = control::RCLK | control::P_IN | control::RESET | control::ENABLE;

/// Random pulse source for free-running simulations.
#[derive(Debug)]
pub struct PulseGenerator {
    rng: StdRng,
    pulse_probability: f64,
    channel_count: u8,
    max_hits: u8,
    t_max: u16,
}

impl PulseGenerator {
    /// Each status poll of an armed, idle card produces a pulse with the given probability.
    pub fn new(pulse_probability: f64, channel_count: u8, max_hits: u8, t_max: u16) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            pulse_probability: pulse_probability.clamp(0.0, 1.0),
            channel_count: channel_count.max(1),
            max_hits,
            t_max,
        }
    }

    /// Use a fixed seed for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn maybe_pulse(&mut self) -> Option<Vec<Hit>> {
        if !self.rng.gen_bool(self.pulse_probability) {
            return None;
        }
        let count = self.rng.gen_range(0..=self.max_hits);
        let mut hits: Vec<Hit> = (0..count)
            .map(|_| Hit {
                channel: self.rng.gen_range(0..self.channel_count),
                delay: self.rng.gen_range(0..=self.t_max),
            })
            .collect();
        hits.sort_by_key(|h| h.channel);
        Some(hits)
    }
}

struct Hold {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

/// Test handle for a status read parked inside the simulated card.
pub struct IoHold {
    entered: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl IoHold {
    /// Wait until some thread is parked in the held read.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered.recv_timeout(timeout).is_ok()
    }

    /// Let the parked read complete.
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

#[derive(Default)]
struct SimState {
    floating: bool,
    pulses: VecDeque<Vec<Hit>>,
    generator: Option<PulseGenerator>,
    armed: bool,
    reset_seen: bool,
    clock_pulses: usize,
    readout: Option<VecDeque<Hit>>,
    current: Option<Hit>,
    last_control: u8,
    config: (u8, u8),
    write_log: VecDeque<PortWrite>,
    writes: u64,
    reads: u64,
    hold: Option<Hold>,
}

impl SimState {
    fn control(&mut self, value: u8) {
        let word = value & HANDSHAKE_MASK;
        let previous = self.last_control;
        self.last_control = word;

        if word & control::RESET != 0 {
            self.armed = false;
            self.reset_seen = true;
            self.readout = None;
            self.current = None;
            return;
        }

        if word == control::P_IN && self.reset_seen {
            self.reset_seen = false;
            self.armed = true;
            self.clock_pulses = 0;
            return;
        }

        let rclk_fell = previous & control::RCLK != 0 && word & control::RCLK == 0;
        let p_in = word & control::P_IN != 0;

        match (rclk_fell, p_in) {
            // RCLK while idle: latch clock
            (true, true) if self.readout.is_none() => {
                self.clock_pulses += 1;
            }
            // RCLK then P.in* high: readout finished
            (true, true) => {
                self.readout = None;
                self.current = None;
                self.pulses.pop_front();
                self.armed = false;
            }
            // RCLK with P.in* low: shift next hit
            (true, false) => {
                if let Some(readout) = self.readout.as_mut() {
                    self.current = readout.pop_front();
                }
            }
            // P.in* dropped after the latch clock
            (false, false) if previous & control::P_IN != 0 => {
                if self.armed && self.clock_pulses >= LATCH_CLOCK_PULSES {
                    let hits = self.pulses.front().cloned().unwrap_or_default();
                    self.readout = Some(hits.into_iter().collect());
                }
                self.clock_pulses = 0;
            }
            _ => {}
        }
    }

    fn status(&mut self) -> u8 {
        if self.armed && self.pulses.is_empty() {
            if let Some(generator) = self.generator.as_mut() {
                if let Some(pulse) = generator.maybe_pulse() {
                    self.pulses.push_back(pulse);
                }
            }
        }
        let mut value = 0;
        if self.armed && !self.pulses.is_empty() {
            value |= status::COM_DISABLED;
        }
        if let Some(hit) = self.current {
            value |= (hit.channel << status::CHANNEL_SHIFT) & status::CHANNEL_MASK;
        }
        if self.readout.as_ref().is_some_and(|r| !r.is_empty()) {
            value |= status::P_OUT;
        }
        value
    }
}

/// Simulated TDC8 card. See the module documentation.
#[derive(Clone, Default)]
pub struct MockTdcCard {
    state: Arc<Mutex<SimState>>,
}

impl MockTdcCard {
    /// A populated card with no pulses queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty ISA bus: every read returns all ones.
    pub fn floating() -> Self {
        let card = Self::new();
        card.state.lock().floating = true;
        card
    }

    /// A card fed by a random pulse generator.
    pub fn with_generator(generator: PulseGenerator) -> Self {
        let card = Self::new();
        card.state.lock().generator = Some(generator);
        card
    }

    /// Queue one reference pulse carrying `(channel, delay)` hits in readout order.
    pub fn push_pulse(&self, hits: &[(u8, u16)]) {
        let hits = hits
            .iter()
            .map(|&(channel, delay)| Hit { channel, delay })
            .collect();
        self.state.lock().pulses.push_back(hits);
    }

    /// Pulses not yet read out.
    pub fn pending_pulses(&self) -> usize {
        self.state.lock().pulses.len()
    }

    /// Whether the simulated chip is armed.
    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// The last configuration bytes written to `PIA1PA` / `PIA2PA`.
    pub fn config_bytes(&self) -> (u8, u8) {
        self.state.lock().config
    }

    /// Total port writes.
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Total port reads.
    pub fn read_count(&self) -> u64 {
        self.state.lock().reads
    }

    /// Most recent port writes, oldest first.
    pub fn write_log(&self) -> Vec<PortWrite> {
        self.state.lock().write_log.iter().copied().collect()
    }

    /// Clear the write log.
    pub fn clear_write_log(&self) {
        self.state.lock().write_log.clear();
    }

    /// Park the next status read until the returned handle is released.
    pub fn hold_next_status_read(&self) -> IoHold {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        self.state.lock().hold = Some(Hold {
            entered: entered_tx,
            release: release_rx,
        });
        IoHold {
            entered: entered_rx,
            release: release_tx,
        }
    }
}

impl PortIo for MockTdcCard {
    fn write_u8(&mut self, port: Port, value: u8) -> Result<()> {
        let mut state = self.state.lock();
        state.writes += 1;
        if state.write_log.len() == WRITE_LOG_CAPACITY {
            state.write_log.pop_front();
        }
        state.write_log.push_back(PortWrite { port, value });

        match port {
            Port::Pia1Pa => state.config.0 = value,
            Port::Pia2Pa => state.config.1 = value,
            Port::Pia2Pb => state.control(value),
            Port::Pia1Pb | Port::Ctrl1 | Port::Ctrl2 => {}
        }
        Ok(())
    }

    fn read_u8(&mut self, port: Port) -> Result<u8> {
        let hold = {
            let mut state = self.state.lock();
            state.reads += 1;
            if port == Port::Pia1Pb {
                state.hold.take()
            } else {
                None
            }
        };
        if let Some(hold) = hold {
            let _ = hold.entered.send(());
            let _ = hold.release.recv();
        }

        let mut state = self.state.lock();
        if state.floating {
            return Ok(0xFF);
        }
        let value = match port {
            Port::Pia1Pb => state.status(),
            Port::Pia1Pa => state.current.map_or(0, |h| h.delay.to_be_bytes()[0]),
            Port::Pia2Pa => state.current.map_or(0, |h| h.delay.to_be_bytes()[1]),
            Port::Pia2Pb => state.last_control,
            Port::Ctrl1 | Port::Ctrl2 => 0,
        };
        Ok(value)
    }

    fn read_base_u32(&mut self) -> Result<u32> {
        let mut state = self.state.lock();
        state.reads += 1;
        Ok(if state.floating {
            u32::MAX
        } else {
            PROBE_WORD
        })
    }

    fn describe(&self) -> String {
        if self.state.lock().floating {
            "simulated TDC8 (floating bus)".to_string()
        } else {
            "simulated TDC8".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::registers::{self, ComMode, RegisterSettings};

    fn run(mock: &mut MockTdcCard, writes: &[PortWrite]) {
        for w in writes {
            mock.write_u8(w.port, w.value).unwrap();
        }
    }

    fn settings(mode: ComMode) -> RegisterSettings {
        RegisterSettings {
            t_max: 1000,
            max_hits_per_channel: 16,
            com_mode: mode,
        }
    }

    #[test]
    fn test_arm_then_pulse_sets_com_bit() {
        let mut mock = MockTdcCard::new();
        mock.push_pulse(&[]);
        assert_eq!(mock.read_u8(Port::Pia1Pb).unwrap() & status::COM_DISABLED, 0);

        run(&mut mock, &registers::arm_sequence(&settings(ComMode::CommonStart)));
        assert!(mock.is_armed());
        assert_ne!(mock.read_u8(Port::Pia1Pb).unwrap() & status::COM_DISABLED, 0);
    }

    #[test]
    fn test_common_stop_arm_sequence_arms() {
        let mut mock = MockTdcCard::new();
        run(&mut mock, &registers::arm_sequence(&settings(ComMode::CommonStop)));
        assert!(mock.is_armed());
    }

    #[test]
    fn test_latch_strobe_release() {
        let mut mock = MockTdcCard::new();
        let mode = ComMode::CommonStart;
        mock.push_pulse(&[(2, 100), (5, 40000)]);
        run(&mut mock, &registers::arm_sequence(&settings(mode)));
        run(&mut mock, &registers::latch_sequence(mode));
        assert_ne!(mock.read_u8(Port::Pia1Pb).unwrap() & status::P_OUT, 0);

        run(&mut mock, &registers::readout_strobe(mode));
        let high = mock.read_u8(Port::Pia1Pa).unwrap();
        let low = mock.read_u8(Port::Pia2Pa).unwrap();
        let st = mock.read_u8(Port::Pia1Pb).unwrap();
        assert_eq!(registers::delay_from_bytes(high, low), 100);
        assert_eq!(registers::status_channel(st), 2);
        assert!(registers::status_has_hits(st));

        run(&mut mock, &registers::readout_strobe(mode));
        let st = mock.read_u8(Port::Pia1Pb).unwrap();
        assert_eq!(registers::status_channel(st), 5);
        assert!(!registers::status_has_hits(st));

        run(&mut mock, &registers::release_sequence(mode));
        assert_eq!(mock.pending_pulses(), 0);
        assert!(!mock.is_armed());
    }

    #[test]
    fn test_floating_bus_reads_all_ones() {
        let mut mock = MockTdcCard::floating();
        assert_eq!(mock.read_base_u32().unwrap(), u32::MAX);
        assert_eq!(mock.read_u8(Port::Pia1Pb).unwrap(), 0xFF);
        assert_eq!(mock.read_u8(Port::Pia2Pa).unwrap(), 0xFF);
    }

    #[test]
    fn test_config_bytes_recorded() {
        let mut mock = MockTdcCard::new();
        run(&mut mock, &registers::setup_sequence(&settings(ComMode::CommonStart)));
        assert_eq!(mock.config_bytes(), (0x03, 0xE0));
        assert_eq!(mock.write_count(), 5);
    }

    #[test]
    fn test_generator_produces_pulses_when_armed() {
        let generator = PulseGenerator::new(1.0, 4, 3, 1000).with_seed(7);
        let mut mock = MockTdcCard::with_generator(generator);
        assert_eq!(mock.read_u8(Port::Pia1Pb).unwrap() & status::COM_DISABLED, 0);
        run(&mut mock, &registers::arm_sequence(&settings(ComMode::CommonStart)));
        assert_ne!(mock.read_u8(Port::Pia1Pb).unwrap() & status::COM_DISABLED, 0);
        assert_eq!(mock.pending_pulses(), 1);
    }

    #[test]
    fn test_hold_parks_status_read() {
        let mock = MockTdcCard::new();
        let hold = mock.hold_next_status_read();
        let mut reader = mock.clone();
        let handle = std::thread::spawn(move || reader.read_u8(Port::Pia1Pb).unwrap());
        assert!(hold.wait_entered(Duration::from_secs(5)));
        hold.release();
        assert_eq!(handle.join().unwrap(), 0);
    }
}
