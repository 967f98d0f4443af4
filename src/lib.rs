//! # TDC8 acquisition driver
//!
//! Drives a RoentDek TDC8 time-to-digital converter card: a fixed-period poll checks
//! the card for a reference ("COM") pulse, reads back the per-channel hits, classifies
//! them against the acceptance window and hands serialized events to a consumer
//! through a bounded ring buffer, while a measurement state machine tracks the session
//! and its counters.
//!
//! ## Crate structure
//!
//! - **`hardware`**: register map and handshake sequences, the port I/O seam with its
//!   `/dev/port` backend, the card operations, and a simulated card.
//! - **`data`**: the event record wire format and the event ring buffer.
//! - **`acquisition`**: event cache, decode engine, measurement state machine, rate
//!   statistics, poll scheduler and the [`TdcDevice`] that ties them together.
//! - **`command`**: typed control commands and their dispatcher.
//! - **`status`**: the read-only status snapshot.
//! - **`config`**: layered configuration (TOML file + `TDC_` environment).
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: [`TdcError`] and its reportable classification.
//! - **`sync`**: blocking notification with interrupt and timeout outcomes.
//! - **`timing`**: host clock resolution check.
//!
//! ## Quick start
//!
//! ```no_run
//! use tdc_daq::{config::TdcConfig, hardware::MockTdcCard, TdcDevice, WaitPolicy};
//!
//! # fn main() -> tdc_daq::Result<()> {
//! let config = TdcConfig::default();
//! let mock = MockTdcCard::new();
//! let device = TdcDevice::attach(Box::new(mock.clone()), &config)?;
//!
//! mock.push_pulse(&[(0, 500), (0, 1500)]);
//! device.start(None)?;
//! // ... the poll thread decodes the pulse into the event buffer ...
//! device.stop(WaitPolicy::BLOCK)?;
//! println!("{}", device.snapshot());
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod command;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod status;
pub mod sync;
pub mod timing;

pub use acquisition::{EventReader, TdcDevice, WaitPolicy};
pub use error::{Result, TdcError};
