//! Register map and handshake sequences of the TDC8 ISA card.
//!
//! The card exposes eight consecutive I/O ports starting at its base address. Two
//! 8255-style PIA chips drive the MTD133B time-to-digital converter: port A of each
//! PIA carries the configuration / data byte, port B of PIA1 is the status input and
//! port B of PIA2 is the control output.
//!
//! Every handshake step is expressed here as a pure function returning the port
//! writes it performs, so the exact byte sequences are testable without hardware.
//! [`TdcCard`](super::card::TdcCard) executes them against a
//! [`PortIo`](super::port::PortIo) backend.
//!
//! ```text
//! PIA2PB (control) bit layout
//!   7  RCLK              readout clock
//!   6  CSTP_TRIG         common stop trigger
//!   5  COM_MODE          HI = common start
//!   4  P_IN*             data input line
//!   3  RESET
//!   0  ENABLE*
//!
//! PIA1PB (status) bit layout
//!   7  COM_DISABLED      reference pulse seen, data collection finished
//!   4..2 CH              channel of the hit in the data registers
//!   1  P_OUT*            hit data pending
//! ```

use serde::{Deserialize, Serialize};

/// Number of consecutive I/O ports occupied by the card.
pub const PORT_SPAN: u16 = 8;

/// Default ISA base address of the card.
pub const DEFAULT_BASE_ADDRESS: u16 = 0x320;

/// Largest delay the card can report, in 0.5 ns units.
pub const MAX_DELAY: u16 = 0xFFFF;

/// Hardware limit on hits stored per channel per reference pulse.
pub const MAX_HITS_PER_CHANNEL: u8 = 16;

/// Number of input channels on the card.
pub const MAX_CHANNELS: u8 = 8;

/// Value read from an unpopulated ISA bus.
pub const FLOATING_BUS: u32 = 0xFFFF_FFFF;

/// Number of RCLK pulses needed to latch hit data into the readout registers.
pub const LATCH_CLOCK_PULSES: usize = 3;

/// I/O port offsets relative to the base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Port {
    /// PIA1 port A: configuration high byte / delay high byte.
    Pia1Pa = 0,
    /// PIA1 port B: status input.
    Pia1Pb = 1,
    /// PIA1 control register.
    Ctrl1 = 3,
    /// PIA2 port A: configuration low byte / delay low byte.
    Pia2Pa = 4,
    /// PIA2 port B: control output.
    Pia2Pb = 5,
    /// PIA2 control register.
    Ctrl2 = 7,
}

impl Port {
    /// Offset of this port from the card's base address.
    pub fn offset(self) -> u16 {
        self as u16
    }
}

/// Status bits of `PIA1PB`.
pub mod status {
    /// Hit data pending (P.out*).
    pub const P_OUT: u8 = 0x02;
    /// Channel number, three bits.
    pub const CHANNEL_MASK: u8 = 0x1C;
    /// Shift applied after masking the channel bits.
    pub const CHANNEL_SHIFT: u8 = 2;
    /// Reference pulse registered, data collection finished.
    pub const COM_DISABLED: u8 = 0x80;
}

/// Control bits of `PIA2PB`.
pub mod control {
    /// Enable* line.
    pub const ENABLE: u8 = 0x01;
    /// TDC chip reset.
    pub const RESET: u8 = 0x08;
    /// P.in* data line.
    pub const P_IN: u8 = 0x10;
    /// Common start mode select.
    pub const COM_MODE: u8 = 0x20;
    /// Common stop trigger.
    pub const CSTP_TRIG: u8 = 0x40;
    /// Readout clock.
    pub const RCLK: u8 = 0x80;
}

/// PIA mode words written to the control registers at setup.
pub const CTRL1_MODE: u8 = 0xC3;
/// See [`CTRL1_MODE`].
pub const CTRL2_MODE: u8 = 0xC1;

/// Timing mode of the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComMode {
    /// The reference pulse starts the time measurement.
    #[default]
    CommonStart,
    /// The reference pulse stops the time measurement.
    CommonStop,
}

impl ComMode {
    /// Bits OR-ed into every control word for this mode.
    pub fn control_bits(self) -> u8 {
        match self {
            Self::CommonStart => control::COM_MODE,
            Self::CommonStop => 0,
        }
    }
}

impl std::fmt::Display for ComMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommonStart => write!(f, "common start"),
            Self::CommonStop => write!(f, "common stop"),
        }
    }
}

/// The settings that shape the register writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSettings {
    /// Upper edge of the acceptance window, 0.5 ns units.
    pub t_max: u16,
    /// Hits stored per channel (1..=16).
    pub max_hits_per_channel: u8,
    /// Timing mode.
    pub com_mode: ComMode,
}

/// A single byte written to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortWrite {
    /// Target port.
    pub port: Port,
    /// Value written.
    pub value: u8,
}

impl PortWrite {
    fn new(port: Port, value: u8) -> Self {
        Self { port, value }
    }
}

/// The two configuration bytes derived from the acceptance window and hit limit.
///
/// The vendor documentation labels these registers the other way round; the values
/// are written where the working driver writes them and should be treated as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigBytes {
    /// Written to `PIA1PA`.
    pub high: u8,
    /// Written to `PIA2PA`.
    pub low: u8,
}

/// Compute the configuration bytes for the given settings.
pub fn config_bytes(settings: &RegisterSettings) -> ConfigBytes {
    let t_max = settings.t_max;
    let high = (t_max >> 8) as u8;
    // Hit limit nibble: 0 encodes 16.
    let hits = settings.max_hits_per_channel & 0x0F;
    let low = (((t_max % 0xFF) as u8) & 0xF0) | hits;
    ConfigBytes { high, low }
}

fn config_writes(settings: &RegisterSettings) -> [PortWrite; 2] {
    let bytes = config_bytes(settings);
    [
        PortWrite::new(Port::Pia1Pa, bytes.high),
        PortWrite::new(Port::Pia2Pa, bytes.low),
    ]
}

/// Control word with Enable* and P.in* high: the idle state between cycles.
pub fn idle_word(mode: ComMode) -> u8 {
    control::P_IN | control::ENABLE | mode.control_bits()
}

/// Control word with P.in* low: hit data latched for readout.
pub fn latched_word(mode: ComMode) -> u8 {
    control::ENABLE | mode.control_bits()
}

/// Program the acceptance window, hit limit and PIA modes.
pub fn setup_sequence(settings: &RegisterSettings) -> Vec<PortWrite> {
    let mut writes = config_writes(settings).to_vec();
    writes.push(PortWrite::new(Port::Ctrl1, CTRL1_MODE));
    writes.push(PortWrite::new(Port::Ctrl2, CTRL2_MODE));
    writes.push(PortWrite::new(Port::Pia2Pb, idle_word(settings.com_mode)));
    writes
}

/// Re-program the configuration and reset the TDC chip so it waits for the next
/// reference pulse. The card stops seeing pulses after a few seconds unless this runs
/// before every wait cycle.
pub fn arm_sequence(settings: &RegisterSettings) -> Vec<PortWrite> {
    let mode = settings.com_mode;
    let mut writes = config_writes(settings).to_vec();
    writes.push(PortWrite::new(
        Port::Pia2Pb,
        control::P_IN | control::RESET | control::ENABLE | mode.control_bits(),
    ));
    if mode == ComMode::CommonStop {
        writes.push(PortWrite::new(
            Port::Pia2Pb,
            control::CSTP_TRIG | control::P_IN | control::ENABLE,
        ));
    }
    writes.push(PortWrite::new(
        Port::Pia2Pb,
        control::P_IN | mode.control_bits(),
    ));
    writes
}

/// Raise Enable*, clock RCLK three times, then drop P.in* to latch hit data.
pub fn latch_sequence(mode: ComMode) -> Vec<PortWrite> {
    let idle = idle_word(mode);
    let mut writes = Vec::with_capacity(2 + 2 * LATCH_CLOCK_PULSES);
    writes.push(PortWrite::new(Port::Pia2Pb, idle));
    for _ in 0..LATCH_CLOCK_PULSES {
        writes.push(PortWrite::new(Port::Pia2Pb, idle | control::RCLK));
        writes.push(PortWrite::new(Port::Pia2Pb, idle));
    }
    writes.push(PortWrite::new(Port::Pia2Pb, latched_word(mode)));
    writes
}

/// One RCLK pulse with P.in* low shifts the next hit into the data registers.
pub fn readout_strobe(mode: ComMode) -> [PortWrite; 2] {
    let latched = latched_word(mode);
    [
        PortWrite::new(Port::Pia2Pb, latched | control::RCLK),
        PortWrite::new(Port::Pia2Pb, latched),
    ]
}

/// End the readout handshake and re-enable P.in*.
pub fn release_sequence(mode: ComMode) -> [PortWrite; 2] {
    [
        PortWrite::new(Port::Pia2Pb, latched_word(mode) | control::RCLK),
        PortWrite::new(Port::Pia2Pb, idle_word(mode)),
    ]
}

/// Whether a status byte reports a registered reference pulse.
pub fn status_has_reference(status: u8) -> bool {
    status & status::COM_DISABLED != 0
}

/// Whether a status byte reports pending hit data.
pub fn status_has_hits(status: u8) -> bool {
    status & status::P_OUT != 0
}

/// Channel index (0-based) encoded in a status byte.
pub fn status_channel(status: u8) -> u8 {
    (status & status::CHANNEL_MASK) >> status::CHANNEL_SHIFT
}

/// Assemble a delay from the two data registers.
pub fn delay_from_bytes(high: u8, low: u8) -> u16 {
    u16::from_be_bytes([high, low])
}
