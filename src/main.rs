//! CLI entry point for tdc-daq
//!
//! Provides:
//! - `run`: configure the card, start a measurement, drain the event stream to a file
//!   (or just count it) and print the final status as JSON
//! - `probe`: attach, report whether a card answers and print its status
//! - `config`: print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! tdc-daq --config config/tdc.toml run --limit 10000 --output events.bin
//! tdc-daq run --simulate --duration 5s
//! tdc-daq probe
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tdc_daq::command::{self, Command};
use tdc_daq::config::{TdcConfig, DEFAULT_CONFIG_PATH};
use tdc_daq::hardware::{MockTdcCard, PulseGenerator};
use tdc_daq::{logging, EventReader, TdcDevice, WaitPolicy};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tdc-daq")]
#[command(about = "Acquisition driver for the TDC8 time-to-digital converter", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a measurement until the pulse limit, the duration or Ctrl-C
    Run(RunArgs),

    /// Attach to the card and report its status
    Probe {
        /// Use the simulated card
        #[arg(long)]
        simulate: bool,

        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration (file plus environment)
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// Reference pulses to record, 0 = unlimited
    #[arg(long)]
    limit: Option<u64>,

    /// Stop after this long, e.g. "30s" or "5m"
    #[arg(long, value_parser = parse_duration)]
    duration: Option<Duration>,

    /// Write the raw event stream here
    #[arg(long)]
    output: Option<PathBuf>,

    /// Acceptance window "t_min,t_max" in 0.5 ns units
    #[arg(long, value_parser = parse_range)]
    time_range: Option<(u32, u32)>,

    /// Poll rate in Hz
    #[arg(long)]
    rate: Option<u64>,

    /// Drive a simulated card with random pulses
    #[arg(long)]
    simulate: bool,

    /// Probability that a simulated poll sees a pulse
    #[arg(long, default_value_t = 0.2)]
    pulse_probability: f64,

    /// Seed for the simulated pulses
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_range(s: &str) -> std::result::Result<(u32, u32), String> {
    let (lo, hi) = s
        .split_once(',')
        .ok_or_else(|| format!("expected t_min,t_max, got '{}'", s))?;
    let lo = lo.trim().parse().map_err(|e| format!("t_min: {}", e))?;
    let hi = hi.trim().parse().map_err(|e| format!("t_max: {}", e))?;
    Ok((lo, hi))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = TdcConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    logging::init(&config.logging)?;

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Probe { simulate, json } => probe(&config, simulate, json),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn open_device(config: &TdcConfig, simulate: Option<(f64, Option<u64>)>) -> Result<TdcDevice> {
    let Some((probability, seed)) = simulate else {
        return TdcDevice::open(config).context("opening TDC card");
    };
    let settings = config.device.card_settings();
    let mut generator = PulseGenerator::new(
        probability,
        settings.channel_count,
        settings.max_hits_per_channel,
        settings.t_max,
    );
    if let Some(seed) = seed {
        generator = generator.with_seed(seed);
    }
    info!(probability, "Using simulated TDC card");
    let mock = MockTdcCard::with_generator(generator);
    TdcDevice::attach(Box::new(mock), config).context("attaching simulated card")
}

fn probe(config: &TdcConfig, simulate: bool, json: bool) -> Result<()> {
    let device = open_device(config, simulate.then_some((0.0, None)))?;
    let status = device.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", status);
    }
    device.detach()?;
    if !status.card_present {
        bail!("no TDC card answered at {:#x}", config.device.base_address);
    }
    Ok(())
}

async fn run(config: TdcConfig, args: RunArgs) -> Result<()> {
    let simulate = args.simulate.then_some((args.pulse_probability, args.seed));
    let device = Arc::new(open_device(&config, simulate)?);

    let mut setup = Vec::new();
    if let Some((t_min, t_max)) = args.time_range {
        setup.push(Command::SetTimeRange { t_min, t_max });
    }
    if let Some(rate_hz) = args.rate {
        setup.push(Command::SetTriggerRateHz { rate_hz });
    }
    setup.push(Command::Start {
        pulse_limit: args.limit,
    });
    for cmd in &setup {
        let reply = command::dispatch(&device, cmd, WaitPolicy::BLOCK);
        if !reply.is_ok() {
            bail!("{} failed: {}", reply.command, serde_json::to_string(&reply)?);
        }
    }

    let reader = device.reader()?;
    let output = args.output.clone();
    let consumer = tokio::task::spawn_blocking(move || drain(reader, output));

    let waiter = Arc::clone(&device);
    let mut stopped = tokio::task::spawn_blocking(move || waiter.wait_stopped(None));
    let deadline = async {
        match args.duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping measurement"),
        _ = deadline => info!("Duration elapsed, stopping measurement"),
        _ = &mut stopped => info!("Measurement stopped"),
    }

    let reply = command::dispatch(&device, &Command::Stop, WaitPolicy::BLOCK);
    if !reply.is_ok() {
        warn!(reply = ?reply, "Stop failed");
    }
    if !stopped.is_finished() {
        // The reader and the waiter both finish once the schedule has ended.
        match stopped.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Waiting for the measurement to stop failed"),
            Err(e) => warn!(error = %e, "Stop waiter task failed"),
        }
    }
    let summary = consumer.await??;

    let status = device.snapshot();
    println!("{}", serde_json::to_string_pretty(&status)?);
    info!(
        events = summary.events,
        hits = summary.hits,
        bytes = summary.bytes,
        "Event stream drained"
    );

    match Arc::try_unwrap(device) {
        Ok(device) => device.detach()?,
        Err(_) => warn!("Device still shared at exit, detaching on drop"),
    }
    Ok(())
}

#[derive(Debug, Default)]
struct DrainSummary {
    events: u64,
    hits: u64,
    bytes: u64,
}

fn drain(mut reader: EventReader, output: Option<PathBuf>) -> Result<DrainSummary> {
    let mut sink = match output {
        Some(path) => Some(BufWriter::new(
            File::create(&path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };
    let mut summary = DrainSummary::default();
    while let Some(event) = reader.read_event(None)? {
        let bytes = event.encode()?;
        summary.events += 1;
        summary.hits += event.len() as u64;
        summary.bytes += bytes.len() as u64;
        if let Some(sink) = sink.as_mut() {
            sink.write_all(&bytes)?;
        }
    }
    if let Some(mut sink) = sink {
        sink.flush()?;
    }
    Ok(summary)
}
