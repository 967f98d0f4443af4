//! Host clock resolution.
//!
//! The poll schedule runs at up to 100 kHz. A host whose monotonic clock is coarser
//! than the configured bound cannot keep that period, so attach refuses to start.

use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TdcError};

/// Resolution of `CLOCK_MONOTONIC`.
pub fn clock_resolution() -> Result<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return Err(TdcError::Io(std::io::Error::last_os_error()));
    }
    let secs = u64::try_from(ts.tv_sec).unwrap_or(0);
    let nanos = u32::try_from(ts.tv_nsec).unwrap_or(0);
    Ok(Duration::new(secs, nanos))
}

/// Fail with [`TdcError::TimerResolution`] if the clock is coarser than `required_ns`.
///
/// Returns the measured resolution.
pub fn require_resolution(required_ns: u64) -> Result<Duration> {
    let resolution = clock_resolution()?;
    check_resolution(resolution, required_ns)?;
    debug!(resolution_ns = resolution.as_nanos() as u64, required_ns, "Clock resolution ok");
    Ok(resolution)
}

fn check_resolution(resolution: Duration, required_ns: u64) -> Result<()> {
    let actual_ns = u64::try_from(resolution.as_nanos()).unwrap_or(u64::MAX);
    if actual_ns > required_ns {
        return Err(TdcError::TimerResolution {
            actual_ns,
            required_ns,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_monotonic_clock_has_a_resolution() {
        let res = clock_resolution().unwrap();
        assert!(res > Duration::ZERO);
        assert!(res <= Duration::from_millis(20));
    }

    #[test]
    fn test_coarse_clock_is_fatal() {
        let err = check_resolution(Duration::from_millis(4), 10_000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(check_resolution(Duration::from_nanos(1), 10_000).is_ok());
        assert!(check_resolution(Duration::from_nanos(10_000), 10_000).is_ok());
    }
}
