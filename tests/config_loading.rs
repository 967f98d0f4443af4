//! Configuration files as shipped and as written by users.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tdc_daq::acquisition::{DriverKind, MeasurementState};
use tdc_daq::config::TdcConfig;
use tdc_daq::hardware::{ComMode, MockTdcCard};
use tdc_daq::logging::LogFormat;
use tdc_daq::TdcDevice;

#[test]
fn test_shipped_config_matches_defaults() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/tdc.toml");
    let config = TdcConfig::load_with_env_prefix(&path, "TDC_IT_SHIPPED_").unwrap();
    assert_eq!(config, TdcConfig::default());
}

#[test]
fn test_full_file_drives_device() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    write!(
        file,
        r#"
        [device]
        base_address = 0x340
        channel_count = 4
        max_hits_per_channel = 2
        t_min = 100
        t_max = 900
        com_mode = "common_stop"
        buffer_size = 512
        probe = true

        [scheduler]
        period = "500us"
        min_rate_hz = 10
        max_rate_hz = 50000
        driver = "manual"
        stats_window_firings = 8
        producer_lock_timeout = "200us"

        [logging]
        level = "debug"
        format = "json"
        ansi = false
        "#
    )
    .unwrap();

    let config = TdcConfig::load_with_env_prefix(file.path(), "TDC_IT_FULL_").unwrap();
    assert_eq!(config.device.base_address, 0x340);
    assert_eq!(config.scheduler.period, Duration::from_micros(500));
    assert_eq!(config.scheduler.driver, DriverKind::Manual);
    assert_eq!(config.logging.format, LogFormat::Json);

    let mock = MockTdcCard::new();
    let device = TdcDevice::attach(Box::new(mock.clone()), &config).unwrap();
    let status = device.snapshot();
    assert_eq!(status.channel_count, 4);
    assert_eq!((status.t_min, status.t_max), (100, 900));
    assert_eq!(status.com_mode, ComMode::CommonStop);
    assert_eq!(status.buffer.capacity, 512);
    assert_eq!(status.trigger_rate_hz, 2000);

    // Hits on channels beyond the configured count are dropped.
    device.start(None).unwrap();
    mock.push_pulse(&[(1, 500), (1, 501), (1, 502), (6, 10)]);
    device.fire();
    let counters = device.snapshot().counters;
    assert_eq!(counters.valid_hits[1], 2);
    assert_eq!(counters.dropped_hits, 2);
    assert_eq!(device.state(), MeasurementState::Started);
    device.detach().unwrap();
}

#[test]
fn test_rate_bounds_from_file_apply_to_commands() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    writeln!(file, "[scheduler]\nmin_rate_hz = 100\nmax_rate_hz = 1000\nperiod = \"2ms\"\ndriver = \"manual\"").unwrap();

    let config = TdcConfig::load_with_env_prefix(file.path(), "TDC_IT_RATES_").unwrap();
    let device = TdcDevice::attach(Box::new(MockTdcCard::new()), &config).unwrap();
    assert!(device.set_trigger_rate_hz(50).is_err());
    assert!(device.set_trigger_rate_hz(2000).is_err());
    device.set_trigger_rate_hz(250).unwrap();
    assert_eq!(device.period(), Duration::from_millis(4));
}
