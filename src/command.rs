//! Typed control commands.
//!
//! A control surface (CLI, socket, whatever the host application uses) builds a
//! [`Command`] and hands it to [`execute`]; nothing in the core parses text. Commands
//! serialize as tagged JSON objects:
//!
//! ```json
//! {"command": "set_time_range", "t_min": 0, "t_max": 1000}
//! {"command": "start", "pulse_limit": 5000}
//! ```
//!
//! Every failure carries a numeric reason code through [`CommandReply`].

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::acquisition::{TdcDevice, WaitPolicy};
use crate::error::{ErrorKind, Result, TdcError};
use crate::hardware::ComMode;

/// A control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Set `t_max` and optionally the per-channel hit capacity.
    SetConfig {
        /// New upper edge of the acceptance window.
        max_delay: u32,
        /// New per-channel hit capacity.
        #[serde(default)]
        max_hits_per_channel: Option<u32>,
    },
    /// Start or resume; an optional pulse limit replaces the current one.
    Start {
        /// Reference pulses to record, 0 = unlimited.
        #[serde(default)]
        pulse_limit: Option<u64>,
    },
    /// Pause a running measurement.
    Pause,
    /// Stop the measurement.
    Stop,
    /// Clear all measurement data.
    Clear,
    /// Set the poll period.
    SetTriggerPeriodNs {
        /// Period in nanoseconds.
        period_ns: u64,
    },
    /// Set the poll rate.
    SetTriggerRateHz {
        /// Rate in Hz.
        rate_hz: u64,
    },
    /// Select the timing mode.
    SetComMode {
        /// common_start or common_stop
        mode: ComMode,
    },
    /// Set the acceptance window.
    SetTimeRange {
        /// Lower edge, 0.5 ns units.
        t_min: u32,
        /// Upper edge, 0.5 ns units.
        t_max: u32,
    },
}

impl Command {
    /// Command name as used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetConfig { .. } => "set_config",
            Self::Start { .. } => "start",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Clear => "clear",
            Self::SetTriggerPeriodNs { .. } => "set_trigger_period_ns",
            Self::SetTriggerRateHz { .. } => "set_trigger_rate_hz",
            Self::SetComMode { .. } => "set_com_mode",
            Self::SetTimeRange { .. } => "set_time_range",
        }
    }
}

/// Run a command. `policy` applies to `pause` and `stop` when a poll firing is in
/// flight.
pub fn execute(device: &TdcDevice, command: &Command, policy: WaitPolicy) -> Result<()> {
    debug!(command = command.name(), "Executing command");
    match *command {
        Command::SetConfig {
            max_delay,
            max_hits_per_channel,
        } => device.set_config(max_delay, max_hits_per_channel),
        Command::Start { pulse_limit } => device.start(pulse_limit),
        Command::Pause => device.pause(policy),
        Command::Stop => device.stop(policy),
        Command::Clear => device.clear(),
        Command::SetTriggerPeriodNs { period_ns } => device.set_trigger_period_ns(period_ns),
        Command::SetTriggerRateHz { rate_hz } => device.set_trigger_rate_hz(rate_hz),
        Command::SetComMode { mode } => device.set_com_mode(mode),
        Command::SetTimeRange { t_min, t_max } => device.set_time_range(t_min, t_max),
    }
}

/// Outcome of a command in reportable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReply {
    /// Command name.
    pub command: &'static str,
    /// 0 on success, otherwise [`ErrorKind::code`].
    pub code: u16,
    /// Failure class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Whether retrying later can succeed.
    pub retryable: bool,
}

impl CommandReply {
    /// Build a reply from the result of [`execute`].
    pub fn from_result(command: &Command, result: &Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                command: command.name(),
                code: 0,
                kind: None,
                message: None,
                retryable: false,
            },
            Err(e) => Self::from_error(command, e),
        }
    }

    fn from_error(command: &Command, error: &TdcError) -> Self {
        warn!(command = command.name(), code = error.code(), error = %error, "Command failed");
        Self {
            command: command.name(),
            code: error.code(),
            kind: Some(error.kind()),
            message: Some(error.to_string()),
            retryable: error.is_retryable(),
        }
    }

    /// Whether the command succeeded.
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Execute and wrap the result.
pub fn dispatch(device: &TdcDevice, command: &Command, policy: WaitPolicy) -> CommandReply {
    let result = execute(device, command, policy);
    CommandReply::from_result(command, &result)
}
