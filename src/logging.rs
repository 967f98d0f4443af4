//! Tracing subscriber setup.
//!
//! Structured logging goes through the `tracing` macros everywhere in the crate; this
//! module only installs the subscriber. `RUST_LOG` overrides the configured level.
//!
//! # Example
//! ```no_run
//! use tdc_daq::logging::{self, LogFormat, LoggingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! logging::init(&LoggingConfig {
//!     level: "debug".into(),
//!     format: LogFormat::Compact,
//!     ..LoggingConfig::default()
//! })?;
//! tracing::info!(base = 0x320, "Attaching card");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::error::{Result, TdcError};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, colored (for development)
    Pretty,
    /// One line per event (for production)
    #[default]
    Compact,
    /// JSON objects (for log aggregation)
    Json,
}

/// `[logging]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Include thread names (the poll timer thread is named)
    pub thread_names: bool,
    /// ANSI colors, pretty and compact formats
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            thread_names: true,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Check the level string.
    pub fn validate(&self) -> Result<()> {
        parse_level(&self.level).map(|_| ())
    }
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed (tests, embedding applications)
/// this returns `Ok(())` and leaves it in place.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let layer = build_layer(config)?;
    // A second init fails with "already set"; that is the idempotent case.
    let _ = tracing_subscriber::registry().with(layer).try_init();
    Ok(())
}

fn build_layer(config: &LoggingConfig) -> Result<BoxedLayer> {
    let level = parse_level(&config.level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_names(config.thread_names)
            .with_ansi(config.ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_thread_names(config.thread_names)
            .with_ansi(config.ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_thread_names(config.thread_names)
            .with_filter(filter)
            .boxed(),
    };
    Ok(layer)
}

fn parse_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(TdcError::invalid(format!(
            "invalid log level '{}', expected one of trace, debug, info, warn, error",
            level
        ))),
    }
}
