//! Register Interface of the TDC8 card.
//!
//! [`TdcCard`] owns the port backend and the settings that shape every handshake.
//! One acquisition cycle looks like:
//!
//! ```text
//! setup ─► arm ─► has_reference_pulse? ─► poll_for_hits? ─► read_next_hit* ─► disarm ─► arm ...
//! ```
//!
//! Decode operations require the card to be armed; calling them otherwise returns
//! [`TdcError::NotInitialized`].

use bitflags::bitflags;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::port::PortIo;
use super::registers::{
    self, ComMode, Port, PortWrite, RegisterSettings, FLOATING_BUS, MAX_CHANNELS, MAX_DELAY,
    MAX_HITS_PER_CHANNEL,
};
use crate::error::{Result, TdcError};

bitflags! {
    /// Sticky fault flags of the device and of a measurement.
    ///
    /// The numeric value is the error code reported in the status snapshot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FaultFlags: u32 {
        /// No card answered the attach probe.
        const NO_CARD = 1;
        /// No reference pulse source.
        const NO_COM = 2;
        /// More hits arrived for one reference pulse than the card can hold.
        const TOO_MANY_HITS = 4;
        /// More events than the event buffer could take.
        const TOO_MANY_EVENTS = 8;
        /// A port read or write failed.
        const HARDWARE_IO = 16;
    }
}

/// A single hit as read from the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Hit {
    /// 0-based channel index.
    pub channel: u8,
    /// Delay relative to the reference pulse, 0.5 ns units.
    pub delay: u16,
}

/// Result of one readout handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readout {
    /// The hit shifted into the data registers.
    pub hit: Hit,
    /// Whether the card signals further pending hits.
    pub more: bool,
}

/// Device settings: acceptance window, per-channel hit capacity, channel count and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CardSettings {
    /// Lower edge of the acceptance window, 0.5 ns units.
    pub t_min: u16,
    /// Upper edge of the acceptance window, 0.5 ns units.
    pub t_max: u16,
    /// Hits stored per channel per reference pulse.
    pub max_hits_per_channel: u8,
    /// Number of channels in use.
    pub channel_count: u8,
    /// Timing mode.
    pub com_mode: ComMode,
}

impl Default for CardSettings {
    fn default() -> Self {
        Self {
            t_min: 0,
            t_max: MAX_DELAY,
            max_hits_per_channel: MAX_HITS_PER_CHANNEL,
            channel_count: MAX_CHANNELS,
            com_mode: ComMode::CommonStart,
        }
    }
}

impl CardSettings {
    /// Check every field against the hardware limits.
    pub fn validate(&self) -> Result<()> {
        if self.t_min > self.t_max {
            return Err(TdcError::invalid(format!(
                "t_min ({}) must not exceed t_max ({})",
                self.t_min, self.t_max
            )));
        }
        if self.max_hits_per_channel == 0 || self.max_hits_per_channel > MAX_HITS_PER_CHANNEL {
            return Err(TdcError::invalid(format!(
                "max_hits_per_channel must be 1..={}, got {}",
                MAX_HITS_PER_CHANNEL, self.max_hits_per_channel
            )));
        }
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(TdcError::invalid(format!(
                "channel_count must be 1..={}, got {}",
                MAX_CHANNELS, self.channel_count
            )));
        }
        Ok(())
    }

    /// Whether a delay lies inside the acceptance window.
    pub fn in_window(&self, delay: u16) -> bool {
        self.t_min <= delay && delay <= self.t_max
    }

    /// Upper bound on hits the cache can hold for one event.
    pub fn event_capacity(&self) -> usize {
        usize::from(self.channel_count) * usize::from(self.max_hits_per_channel)
    }

    fn registers(&self) -> RegisterSettings {
        RegisterSettings {
            t_max: self.t_max,
            max_hits_per_channel: self.max_hits_per_channel,
            com_mode: self.com_mode,
        }
    }
}

/// The TDC card: port backend plus the state the handshakes depend on.
pub struct TdcCard {
    io: Box<dyn PortIo>,
    settings: CardSettings,
    initialized: bool,
    faults: FaultFlags,
}

impl std::fmt::Debug for TdcCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdcCard")
            .field("io", &self.io.describe())
            .field("settings", &self.settings)
            .field("initialized", &self.initialized)
            .field("faults", &self.faults)
            .finish()
    }
}

impl TdcCard {
    /// Wrap a port backend. Nothing is written until [`setup`](Self::setup).
    pub fn new(io: Box<dyn PortIo>, settings: CardSettings) -> Self {
        Self {
            io,
            settings,
            initialized: false,
            faults: FaultFlags::empty(),
        }
    }

    /// Current settings.
    pub fn settings(&self) -> &CardSettings {
        &self.settings
    }

    /// Replace the settings. Takes effect on the next [`setup`](Self::setup) or arm.
    pub fn set_settings(&mut self, settings: CardSettings) -> Result<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    /// Whether the card is armed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Sticky device faults.
    pub fn faults(&self) -> FaultFlags {
        self.faults
    }

    /// Raise a fault on the device.
    pub fn raise(&mut self, fault: FaultFlags) {
        self.faults |= fault;
    }

    /// Whether the attach probe found no card.
    pub fn is_absent(&self) -> bool {
        self.faults.contains(FaultFlags::NO_CARD)
    }

    /// Description of the port backend.
    pub fn describe(&self) -> String {
        self.io.describe()
    }

    /// Read a word at the base address. An all-ones value means nothing is on the bus;
    /// the card is flagged absent and the driver keeps running without pulses.
    pub fn probe(&mut self) -> Result<bool> {
        let word = self.io.read_base_u32()?;
        trace!(word = %format!("{:#010x}", word), "Probe read");
        if word == FLOATING_BUS {
            warn!(io = %self.io.describe(), "TDC card seems to be missing");
            self.faults |= FaultFlags::NO_CARD;
            Ok(false)
        } else {
            self.faults.remove(FaultFlags::NO_CARD);
            Ok(true)
        }
    }

    /// Program the acceptance window, hit limit and PIA modes, and clear the device
    /// faults. Absence of the card is not cleared.
    pub fn setup(&mut self) -> Result<()> {
        self.initialized = false;
        self.faults &= FaultFlags::NO_CARD;
        let writes = registers::setup_sequence(&self.settings.registers());
        self.write_all(&writes)?;
        debug!(
            t_max = self.settings.t_max,
            hits = self.settings.max_hits_per_channel,
            mode = %self.settings.com_mode,
            "TDC card set up"
        );
        Ok(())
    }

    /// Re-arm the card for the next reference pulse.
    pub fn arm(&mut self) -> Result<()> {
        self.initialized = false;
        let writes = registers::arm_sequence(&self.settings.registers());
        self.write_all(&writes)?;
        self.initialized = true;
        Ok(())
    }

    /// Single status read: has a reference pulse been registered?
    ///
    /// An absent card never reports a pulse and the bus is not touched.
    pub fn has_reference_pulse(&mut self) -> Result<bool> {
        if self.is_absent() {
            return Ok(false);
        }
        let status = self.read(Port::Pia1Pb)?;
        Ok(registers::status_has_reference(status))
    }

    /// Latch the hit data and report whether any channel produced data.
    pub fn poll_for_hits(&mut self) -> Result<bool> {
        self.require_initialized("poll_for_hits")?;
        let writes = registers::latch_sequence(self.settings.com_mode);
        self.write_all(&writes)?;
        let status = self.read(Port::Pia1Pb)?;
        trace!(status = %format!("{:#04x}", status), "Latched hit status");
        Ok(registers::status_has_hits(status))
    }

    /// Shift the next hit into the data registers and read it.
    pub fn read_next_hit(&mut self) -> Result<Readout> {
        self.require_initialized("read_next_hit")?;
        let strobe = registers::readout_strobe(self.settings.com_mode);
        self.write_all(&strobe)?;
        let high = self.read(Port::Pia1Pa)?;
        let low = self.read(Port::Pia2Pa)?;
        let status = self.read(Port::Pia1Pb)?;
        let hit = Hit {
            channel: registers::status_channel(status),
            delay: registers::delay_from_bytes(high, low),
        };
        Ok(Readout {
            hit,
            more: registers::status_has_hits(status),
        })
    }

    /// End the readout handshake.
    pub fn disarm(&mut self) -> Result<()> {
        self.require_initialized("disarm")?;
        let writes = registers::release_sequence(self.settings.com_mode);
        self.initialized = false;
        self.write_all(&writes)
    }

    fn require_initialized(&self, operation: &'static str) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(TdcError::NotInitialized { operation })
        }
    }

    fn write_all(&mut self, writes: &[PortWrite]) -> Result<()> {
        for write in writes {
            if let Err(e) = self.io.write_u8(write.port, write.value) {
                self.faults |= FaultFlags::HARDWARE_IO;
                return Err(e);
            }
        }
        Ok(())
    }

    fn read(&mut self, port: Port) -> Result<u8> {
        self.io.read_u8(port).map_err(|e| {
            self.faults |= FaultFlags::HARDWARE_IO;
            e
        })
    }
}
