//! Measurement lifecycle through the device API.

use std::thread;
use std::time::Duration;

use tdc_daq::acquisition::{DriverKind, FireOutcome, MeasurementState};
use tdc_daq::config::TdcConfig;
use tdc_daq::error::ErrorKind;
use tdc_daq::hardware::{ComMode, MockTdcCard};
use tdc_daq::{TdcDevice, TdcError, WaitPolicy};

fn setup() -> (MockTdcCard, TdcDevice) {
    let mut config = TdcConfig::default();
    config.scheduler.driver = DriverKind::Manual;
    config.device.buffer_size = 1024;
    let mock = MockTdcCard::new();
    let device = TdcDevice::attach(Box::new(mock.clone()), &config).unwrap();
    (mock, device)
}

#[test]
fn test_start_while_running_changes_nothing() {
    let (mock, device) = setup();
    device.start(Some(10)).unwrap();
    mock.push_pulse(&[(0, 1)]);
    device.fire();

    let err = device.start(Some(99)).unwrap_err();
    assert!(matches!(err, TdcError::AlreadyRunning));
    assert_eq!(err.kind(), ErrorKind::State);

    let status = device.snapshot();
    assert_eq!(status.state, MeasurementState::Started);
    assert_eq!(status.pulse_limit, 10);
    assert_eq!(status.counters.pulses, 1);
}

#[test]
fn test_start_from_stopped_begins_fresh() {
    let (mock, device) = setup();
    device.start(Some(5)).unwrap();
    mock.push_pulse(&[(1, 7)]);
    device.fire();
    device.stop(WaitPolicy::NonBlocking).unwrap();
    assert_eq!(device.fire(), FireOutcome::Terminated);
    assert_eq!(device.buffered_bytes(), 4);

    device.start(None).unwrap();
    let status = device.snapshot();
    assert_eq!(status.state, MeasurementState::Started);
    assert_eq!(status.counters.pulses, 0);
    assert_eq!(status.counters.total_hits, 0);
    assert_eq!(status.pulse_limit, 0);
    assert_eq!(status.buffer.used, 0);
    assert!(status.schedule_active);
}

#[test]
fn test_pause_resume_keeps_duration_and_counters() {
    let (mock, device) = setup();
    device.start(None).unwrap();
    mock.push_pulse(&[(2, 3)]);
    device.fire();
    thread::sleep(Duration::from_millis(20));
    device.pause(WaitPolicy::NonBlocking).unwrap();
    assert!(!device.is_schedule_active());

    let paused = device.snapshot();
    assert_eq!(paused.state, MeasurementState::Paused);
    assert!(paused.duration_secs >= 0.02);

    // Time spent paused is not counted.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(device.snapshot().duration_secs, paused.duration_secs);
    assert_eq!(device.fire(), FireOutcome::Terminated);

    device.start(None).unwrap();
    let resumed = device.snapshot();
    assert_eq!(resumed.state, MeasurementState::Started);
    assert_eq!(resumed.counters.pulses, 1);
    assert!(resumed.duration_secs >= paused.duration_secs);

    device.pause(WaitPolicy::NonBlocking).unwrap();
    let err = device.pause(WaitPolicy::NonBlocking).unwrap_err();
    assert!(matches!(err, TdcError::InvalidState { .. }));
}

#[test]
fn test_stop_from_new_is_noop() {
    let (_mock, device) = setup();
    device.stop(WaitPolicy::NonBlocking).unwrap();
    assert_eq!(device.state(), MeasurementState::New);
    device.wait_stopped(Some(Duration::from_millis(10))).unwrap_err();
}

#[test]
fn test_clear_returns_to_new() {
    let (mock, device) = setup();
    device.start(Some(3)).unwrap();
    mock.push_pulse(&[(0, 1), (0, 2)]);
    device.fire();

    device.clear().unwrap();
    let status = device.snapshot();
    assert_eq!(status.state, MeasurementState::New);
    assert_eq!(status.counters.pulses, 0);
    assert_eq!(status.pulse_limit, 0);
    assert_eq!(status.duration_secs, 0.0);
    assert_eq!(status.buffer.used, 0);
    assert!(!status.schedule_active);
    assert_eq!(device.fire(), FireOutcome::Terminated);
}

#[test]
fn test_settings_change_while_running() {
    let (mock, device) = setup();
    device.start(None).unwrap();
    let configured = mock.config_bytes();

    // The registers are written at the next re-arm; the software window applies at once.
    device.set_time_range(10, 0x1200).unwrap();
    assert_eq!(mock.config_bytes(), configured);
    mock.push_pulse(&[(0, 15), (0, 5)]);
    device.fire();
    assert_eq!(mock.config_bytes().0, 0x12);

    let counters = device.snapshot().counters;
    assert_eq!(counters.valid_hits[0], 1);
    assert_eq!(counters.invalid_hits[0], 1);

    device.stop(WaitPolicy::NonBlocking).unwrap();
    device.set_com_mode(ComMode::CommonStop).unwrap();
    let status = device.snapshot();
    assert_eq!((status.t_min, status.t_max), (10, 0x1200));
    assert_eq!(status.com_mode, ComMode::CommonStop);
}
