//! TDC8 hardware layer.
//!
//! - [`registers`]: register map and handshake sequences as pure functions
//! - [`port`]: the [`PortIo`] seam and the `/dev/port` backend
//! - [`card`]: the Register Interface operations on top of a port backend
//! - [`mock`]: a simulated card for tests and `--simulate` runs

pub mod card;
pub mod mock;
pub mod port;
pub mod registers;

pub use card::{CardSettings, FaultFlags, Hit, Readout, TdcCard};
pub use mock::{MockTdcCard, PulseGenerator};
pub use port::{DevPort, PortIo};
pub use registers::ComMode;
