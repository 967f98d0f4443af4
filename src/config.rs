//! Layered configuration.
//!
//! Sources, later ones winning:
//! 1. built-in defaults (every field has one, so an empty file is valid)
//! 2. a TOML file, `config/tdc.toml` by default
//! 3. environment variables prefixed `TDC_`, with `__` separating sections,
//!    e.g. `TDC_DEVICE__T_MAX=1000` or `TDC_SCHEDULER__PERIOD="250us"`
//!
//! ```toml
//! [device]
//! base_address = 0x320
//! t_max = 1000
//!
//! [scheduler]
//! period = "100us"
//! driver = "thread"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::acquisition::scheduler::{DriverKind, RateLimits};
use crate::error::{Result, TdcError};
use crate::hardware::port::DEV_PORT_PATH;
use crate::hardware::registers::DEFAULT_BASE_ADDRESS;
use crate::hardware::{CardSettings, ComMode};
use crate::logging::LoggingConfig;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/tdc.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TDC_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TdcConfig {
    /// Card and buffer
    pub device: DeviceConfig,
    /// Poll schedule
    pub scheduler: SchedulerConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// `[device]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// First I/O port of the card.
    pub base_address: u16,
    /// Port device used for register access.
    pub port_path: PathBuf,
    /// Channels in use, 1..=8.
    pub channel_count: u8,
    /// Hits kept per channel and event, 1..=16.
    pub max_hits_per_channel: u8,
    /// Lower edge of the acceptance window, 0.5 ns units.
    pub t_min: u16,
    /// Upper edge of the acceptance window, 0.5 ns units.
    pub t_max: u16,
    /// Timing mode.
    pub com_mode: ComMode,
    /// Event ring buffer size in bytes.
    pub buffer_size: usize,
    /// Probe for the card at attach.
    pub probe: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let card = CardSettings::default();
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
            port_path: PathBuf::from(DEV_PORT_PATH),
            channel_count: card.channel_count,
            max_hits_per_channel: card.max_hits_per_channel,
            t_min: card.t_min,
            t_max: card.t_max,
            com_mode: card.com_mode,
            buffer_size: default_buffer_size(),
            probe: true,
        }
    }
}

fn default_buffer_size() -> usize {
    0xF_FFFF
}

impl DeviceConfig {
    /// Card settings described by this section.
    pub fn card_settings(&self) -> CardSettings {
        CardSettings {
            t_min: self.t_min,
            t_max: self.t_max,
            max_hits_per_channel: self.max_hits_per_channel,
            channel_count: self.channel_count,
            com_mode: self.com_mode,
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Poll period.
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Lowest trigger rate a command may set.
    pub min_rate_hz: u64,
    /// Highest trigger rate a command may set.
    pub max_rate_hz: u64,
    /// Who fires the schedule.
    pub driver: DriverKind,
    /// Firings per statistics window; defaults to the poll rate, i.e. about one second.
    pub stats_window_firings: Option<u64>,
    /// Longest wait for the event buffer lock before an event is counted as lost.
    #[serde(with = "humantime_serde")]
    pub producer_lock_timeout: Duration,
    /// Coarsest acceptable monotonic clock resolution.
    pub required_clock_resolution_ns: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let limits = RateLimits::default();
        Self {
            period: Duration::from_micros(100),
            min_rate_hz: limits.min_rate_hz,
            max_rate_hz: limits.max_rate_hz,
            driver: DriverKind::default(),
            stats_window_firings: None,
            producer_lock_timeout: Duration::from_millis(1),
            required_clock_resolution_ns: 10_000,
        }
    }
}

impl SchedulerConfig {
    /// Trigger rate bounds.
    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            min_rate_hz: self.min_rate_hz,
            max_rate_hz: self.max_rate_hz,
        }
    }
}

impl TdcConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file is not an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    /// Load from a file and environment variables with a custom prefix.
    pub fn load_with_env_prefix(path: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(prefix).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML, in the layout of the config file.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TdcError::invalid(format!("cannot render configuration: {}", e)))
    }

    /// Check every value against its permitted range.
    pub fn validate(&self) -> Result<()> {
        self.device.card_settings().validate()?;

        if self.device.buffer_size < 2 {
            return Err(TdcError::invalid(format!(
                "buffer_size {} too small, need at least 2 bytes",
                self.device.buffer_size
            )));
        }

        let sched = &self.scheduler;
        if sched.min_rate_hz == 0 || sched.min_rate_hz > sched.max_rate_hz {
            return Err(TdcError::invalid(format!(
                "rate bounds {}..={} Hz invalid",
                sched.min_rate_hz, sched.max_rate_hz
            )));
        }
        if sched.max_rate_hz > 1_000_000_000 {
            return Err(TdcError::invalid(format!(
                "max_rate_hz {} exceeds 1 GHz",
                sched.max_rate_hz
            )));
        }
        let period_ns = u64::try_from(sched.period.as_nanos()).unwrap_or(u64::MAX);
        sched.rate_limits().check_period_ns(period_ns)?;

        if sched.stats_window_firings == Some(0) {
            return Err(TdcError::invalid("stats_window_firings must be at least 1"));
        }
        if sched.producer_lock_timeout > sched.period.max(Duration::from_millis(10)) {
            return Err(TdcError::invalid(format!(
                "producer_lock_timeout {:?} would stall the poll schedule",
                sched.producer_lock_timeout
            )));
        }

        self.logging.validate()
    }
}
