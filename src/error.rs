//! Error types for the TDC acquisition engine.
//!
//! `TdcError` is the single error type returned by every fallible operation in the
//! crate. Errors fall into the categories the driver has to distinguish at runtime:
//!
//! - **Transient**: `Busy`, `Interrupted`, `WaitTimedOut`. The caller retries or blocks.
//! - **Data loss**: `Overflow`, `TooManyHits`. Loss is accounted in the measurement
//!   counters and acquisition continues.
//! - **Configuration**: `InvalidArgument`, `Config`. Rejected before any state is mutated.
//! - **State**: `AlreadyRunning`, `InvalidState`, `NotInitialized`, `Empty`.
//! - **Environment / fatal**: `Hardware`, `Io`, `TimerResolution`, `RegionUnavailable`.
//!
//! Every error maps onto an [`ErrorKind`] with a stable numeric code so a control
//! surface can report a specific reason for each rejected command.

use thiserror::Error;

use crate::acquisition::measurement::MeasurementState;

/// Result type alias for TDC operations.
pub type Result<T> = std::result::Result<T, TdcError>;

/// Errors that can occur while driving the TDC card.
#[derive(Error, Debug)]
pub enum TdcError {
    /// A command argument is outside its permitted range.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// `start` was issued while the measurement is already running.
    #[error("Measurement is already running")]
    AlreadyRunning,

    /// The operation is not permitted in the current measurement state.
    #[error("Operation '{operation}' not permitted while measurement is {state}")]
    InvalidState {
        operation: &'static str,
        state: MeasurementState,
    },

    /// A poll firing or another lock holder is in the way; retry later.
    #[error("Busy: {reason}")]
    Busy { reason: String },

    /// A blocking wait was interrupted before its condition was satisfied.
    #[error("Interrupted while waiting for {waiting_for}")]
    Interrupted { waiting_for: &'static str },

    /// A blocking wait hit its deadline before its condition was satisfied.
    #[error("Timed out waiting for {waiting_for}")]
    WaitTimedOut { waiting_for: &'static str },

    /// A decode operation ran before the card was armed or set up.
    #[error("TDC card is not initialized (operation: {operation})")]
    NotInitialized { operation: &'static str },

    /// The ring buffer has too little free space for an event.
    #[error("Event buffer overflow: event needs {needed} bytes, {free} free")]
    Overflow { needed: usize, free: usize },

    /// The ring buffer holds no data.
    #[error("Event buffer is empty")]
    Empty,

    /// More hits arrived for a single reference pulse than the card can hold.
    #[error("Too many hits for one reference pulse ({dropped} dropped, limit {limit})")]
    TooManyHits { dropped: usize, limit: usize },

    /// Hardware reported or exhibited a fault.
    #[error("Hardware error: {message}")]
    Hardware { message: String },

    /// The host clock is too coarse for the configured polling scheme.
    #[error(
        "Timer resolution {actual_ns} ns is coarser than the required {required_ns} ns; \
         a real-time kernel is needed"
    )]
    TimerResolution { actual_ns: u64, required_ns: u64 },

    /// The card's I/O port range could not be reserved.
    #[error("Could not reserve I/O ports {base:#x}..{end:#x}: {message}")]
    RegionUnavailable { base: u16, end: u16, message: String },

    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for TdcError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

/// Coarse classification of [`TdcError`] used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected argument or configuration; nothing was changed.
    InvalidArgument,
    /// Contended resource; retry.
    Busy,
    /// A wait was interrupted or timed out.
    Interrupted,
    /// Operation not valid in the current state.
    State,
    /// Data was discarded and accounted.
    DataLoss,
    /// Hardware misbehaved or could not be reached.
    HardwareFault,
    /// Host environment cannot support the driver.
    Fatal,
}

impl ErrorKind {
    /// Stable numeric code for this kind.
    pub fn code(self) -> u16 {
        match self {
            Self::InvalidArgument => 1,
            Self::Busy => 2,
            Self::Interrupted => 3,
            Self::State => 4,
            Self::DataLoss => 5,
            Self::HardwareFault => 6,
            Self::Fatal => 7,
        }
    }
}

impl TdcError {
    /// Build an `InvalidArgument` error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Build a `Busy` error.
    pub fn busy(reason: impl Into<String>) -> Self {
        Self::Busy {
            reason: reason.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } | Self::Config(_) => ErrorKind::InvalidArgument,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Interrupted { .. } | Self::WaitTimedOut { .. } => ErrorKind::Interrupted,
            Self::AlreadyRunning
            | Self::InvalidState { .. }
            | Self::NotInitialized { .. }
            | Self::Empty => ErrorKind::State,
            Self::Overflow { .. } | Self::TooManyHits { .. } => ErrorKind::DataLoss,
            Self::Hardware { .. } | Self::Io(_) => ErrorKind::HardwareFault,
            Self::TimerResolution { .. } | Self::RegionUnavailable { .. } => ErrorKind::Fatal,
        }
    }

    /// Numeric reason code, see [`ErrorKind::code`].
    pub fn code(&self) -> u16 {
        self.kind().code()
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. } | Self::Interrupted { .. } | Self::WaitTimedOut { .. }
        )
    }

    /// Check if this is a busy condition.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}
