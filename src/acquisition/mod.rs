//! The acquisition engine.
//!
//! ```text
//!  scheduler ──fire──► device ──► card (has_reference_pulse, poll_for_hits)
//!                        │
//!                        ├──► decode ──► cache ──► ring buffer
//!                        ├──► measurement (state, counters)
//!                        └──► stats (rates once per window)
//! ```

pub mod cache;
pub mod decode;
pub mod device;
pub mod measurement;
pub mod scheduler;
pub mod stats;

pub use device::{EventReader, TdcDevice, WaitPolicy};
pub use measurement::{MeasurementCounters, MeasurementState};
pub use scheduler::{DriverKind, FireOutcome};
