//! Byte-wide access to the card's I/O ports.
//!
//! [`PortIo`] is the seam between the register protocol and whatever actually moves
//! bytes: [`DevPort`] for a real ISA card through `/dev/port`, or the simulated card in
//! [`mock`](super::mock).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::registers::{Port, PORT_SPAN};
use crate::error::{Result, TdcError};

/// Default character device giving access to the I/O port space.
pub const DEV_PORT_PATH: &str = "/dev/port";

/// Port-level access to the card.
///
/// Implementations must be cheap per call: the poll path issues a few dozen of these
/// per reference pulse.
pub trait PortIo: Send {
    /// Write one byte to a port.
    fn write_u8(&mut self, port: Port, value: u8) -> Result<()>;

    /// Read one byte from a port.
    fn read_u8(&mut self, port: Port) -> Result<u8>;

    /// Read a 32-bit word starting at the base address. Used only for the attach probe.
    fn read_base_u32(&mut self) -> Result<u32>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

impl<T: PortIo + ?Sized> PortIo for Box<T> {
    fn write_u8(&mut self, port: Port, value: u8) -> Result<()> {
        (**self).write_u8(port, value)
    }

    fn read_u8(&mut self, port: Port) -> Result<u8> {
        (**self).read_u8(port)
    }

    fn read_base_u32(&mut self) -> Result<u32> {
        (**self).read_base_u32()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Port I/O through the `/dev/port` character device.
///
/// The region `base..base + 8` is reserved by an exclusive, non-blocking advisory lock
/// on the device file for as long as this value lives. Requires `CAP_SYS_RAWIO`.
pub struct DevPort {
    file: File,
    path: PathBuf,
    base: u16,
}

impl DevPort {
    /// Open a port device, normally [`DEV_PORT_PATH`], and reserve the card's port range.
    pub fn open_path(path: impl AsRef<Path>, base: u16) -> Result<Self> {
        let path = path.as_ref();
        let end = base.saturating_add(PORT_SPAN);
        let unavailable = |message: String| TdcError::RegionUnavailable { base, end, message };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| unavailable(format!("{}: {}", path.display(), e)))?;

        // SAFETY: the descriptor is owned by `file` and valid for the duration of the call.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(unavailable(format!("region already in use: {}", err)));
        }

        info!(path = %path.display(), base = %format!("{:#x}", base), "Reserved TDC port range");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            base,
        })
    }

    fn address(&self, port: Port) -> u64 {
        u64::from(self.base) + u64::from(port.offset())
    }

    fn bus_error(&self, access: &str, address: u64, err: std::io::Error) -> TdcError {
        TdcError::Hardware {
            message: format!("{} at {:#x} via {}: {}", access, address, self.path.display(), err),
        }
    }
}

impl PortIo for DevPort {
    fn write_u8(&mut self, port: Port, value: u8) -> Result<()> {
        let address = self.address(port);
        self.file
            .write_all_at(&[value], address)
            .map_err(|e| self.bus_error("write", address, e))
    }

    fn read_u8(&mut self, port: Port) -> Result<u8> {
        let address = self.address(port);
        let mut buf = [0u8; 1];
        self.file
            .read_exact_at(&mut buf, address)
            .map_err(|e| self.bus_error("read", address, e))?;
        Ok(buf[0])
    }

    fn read_base_u32(&mut self) -> Result<u32> {
        let address = u64::from(self.base);
        let mut buf = [0u8; 4];
        self.file
            .read_exact_at(&mut buf, address)
            .map_err(|e| self.bus_error("probe read", address, e))?;
        Ok(u32::from_le_bytes(buf))
    }

    fn describe(&self) -> String {
        format!("{} @ {:#x}", self.path.display(), self.base)
    }
}

impl Drop for DevPort {
    fn drop(&mut self) {
        debug!(base = %format!("{:#x}", self.base), "Releasing TDC port range");
        // SAFETY: the descriptor is still owned by `self.file`.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!(path = %self.path.display(), "Error releasing port range lock");
        }
    }
}
