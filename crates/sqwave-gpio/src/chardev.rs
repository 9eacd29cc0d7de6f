//! Linux GPIO character device (`/dev/gpiochipN`) output line.
//!
//! Uses the v1 line-handle uAPI from `<linux/gpio.h>`:
//! - `GPIO_GET_CHIPINFO_IOCTL` to validate the chip and the line offset
//! - `GPIO_GET_LINEHANDLE_IOCTL` to claim the line as an output
//! - `GPIOHANDLE_SET_LINE_VALUES_IOCTL` to drive it
//!
//! The line handle stays valid on its own once requested; the chip
//! descriptor is kept only so that closing the line releases everything the
//! sink opened.

use crate::OutputSink;
use sqwave_common::{Level, WaveError, WaveResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[cfg(target_os = "linux")]
mod uapi {
    use static_assertions::const_assert_eq;
    use std::mem::size_of;

    pub const GPIOHANDLES_MAX: usize = 64;
    pub const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;

    const IOC_READ: u64 = 2;
    const IOC_READ_WRITE: u64 = 3;
    const GPIO_IOC_MAGIC: u64 = 0xB4;

    /// `_IOC(dir, 0xB4, nr, size)` as laid out by the generic ioctl encoding.
    const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
        (dir << 30) | ((size as u64) << 16) | (GPIO_IOC_MAGIC << 8) | nr
    }

    #[repr(C)]
    pub struct GpioChipInfo {
        pub name: [libc::c_char; 32],
        pub label: [libc::c_char; 32],
        pub lines: u32,
    }

    #[repr(C)]
    pub struct GpioHandleRequest {
        pub lineoffsets: [u32; GPIOHANDLES_MAX],
        pub flags: u32,
        pub default_values: [u8; GPIOHANDLES_MAX],
        pub consumer_label: [libc::c_char; 32],
        pub lines: u32,
        pub fd: libc::c_int,
    }

    #[repr(C)]
    pub struct GpioHandleData {
        pub values: [u8; GPIOHANDLES_MAX],
    }

    // Sizes are part of the ioctl numbers and must match the kernel ABI.
    const_assert_eq!(size_of::<GpioChipInfo>(), 68);
    const_assert_eq!(size_of::<GpioHandleRequest>(), 364);
    const_assert_eq!(size_of::<GpioHandleData>(), 64);

    pub const GPIO_GET_CHIPINFO_IOCTL: u64 = ioc(IOC_READ, 0x01, size_of::<GpioChipInfo>());
    pub const GPIO_GET_LINEHANDLE_IOCTL: u64 =
        ioc(IOC_READ_WRITE, 0x03, size_of::<GpioHandleRequest>());
    pub const GPIOHANDLE_SET_LINE_VALUES_IOCTL: u64 =
        ioc(IOC_READ_WRITE, 0x09, size_of::<GpioHandleData>());

    pub fn c_str(raw: &[libc::c_char]) -> String {
        let bytes: Vec<u8> = raw
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::uapi::{
        c_str, GpioChipInfo, GpioHandleData, GpioHandleRequest, GPIOHANDLE_REQUEST_OUTPUT,
        GPIOHANDLE_SET_LINE_VALUES_IOCTL, GPIO_GET_CHIPINFO_IOCTL, GPIO_GET_LINEHANDLE_IOCTL,
    };
    use super::{debug, info, warn, Level, Path, PathBuf, WaveError, WaveResult};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// An open GPIO chip.
    #[derive(Debug)]
    pub struct GpioChip {
        path: PathBuf,
        name: String,
        label: String,
        lines: u32,
        fd: Mutex<Option<OwnedFd>>,
    }

    impl GpioChip {
        /// Open a GPIO character device and read its chip information.
        ///
        /// # Errors
        ///
        /// Returns [`WaveError::HardwareUnavailable`] if the device cannot be
        /// opened or is not a GPIO chip.
        pub fn open(path: &Path) -> WaveResult<Self> {
            let unavailable = |reason: String| WaveError::HardwareUnavailable {
                device: path.display().to_string(),
                reason,
            };

            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| unavailable(e.to_string()))?;
            let fd = OwnedFd::from(file);

            // SAFETY: all-zero is a valid bit pattern for this plain C struct.
            let mut info: GpioChipInfo = unsafe { std::mem::zeroed() };
            // SAFETY: `fd` is open and `info` matches the size encoded in the request.
            let result = unsafe {
                libc::ioctl(
                    fd.as_raw_fd(),
                    GPIO_GET_CHIPINFO_IOCTL as _,
                    &mut info as *mut GpioChipInfo,
                )
            };
            if result < 0 {
                return Err(unavailable(format!(
                    "chip info query failed: {}",
                    std::io::Error::last_os_error()
                )));
            }

            let chip = Self {
                path: path.to_path_buf(),
                name: c_str(&info.name),
                label: c_str(&info.label),
                lines: info.lines,
                fd: Mutex::new(Some(fd)),
            };
            info!(
                path = %chip.path.display(),
                name = %chip.name,
                label = %chip.label,
                lines = chip.lines,
                "GPIO chip opened"
            );
            Ok(chip)
        }

        /// Number of lines the chip exposes.
        pub fn lines(&self) -> u32 {
            self.lines
        }

        fn lock(&self) -> MutexGuard<'_, Option<OwnedFd>> {
            self.fd.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Claim `line` as an output driven to `initial`.
        ///
        /// The chip moves into the returned line so that closing the line
        /// releases both. On failure the chip is dropped and its descriptor closed.
        ///
        /// # Errors
        ///
        /// Returns [`WaveError::LineUnavailable`] if the offset is out of range
        /// or the kernel refuses the request (for example `EBUSY` when another
        /// consumer holds the line).
        pub fn request_output(
            self,
            line: u32,
            initial: Level,
            consumer: &str,
        ) -> WaveResult<GpioLine> {
            if line >= self.lines {
                return Err(WaveError::LineUnavailable {
                    line,
                    reason: format!("{} has only {} lines", self.name, self.lines),
                });
            }

            // SAFETY: all-zero is a valid bit pattern for this plain C struct.
            let mut req: GpioHandleRequest = unsafe { std::mem::zeroed() };
            req.lineoffsets[0] = line;
            req.flags = GPIOHANDLE_REQUEST_OUTPUT;
            req.default_values[0] = initial.as_u8();
            req.lines = 1;
            for (dst, src) in req
                .consumer_label
                .iter_mut()
                .zip(consumer.bytes().take(31))
            {
                *dst = src as libc::c_char;
            }

            let (result, err) = {
                let guard = self.lock();
                let Some(fd) = guard.as_ref() else {
                    return Err(WaveError::Closed);
                };
                // SAFETY: `fd` is open and `req` matches the size encoded in the request.
                let result = unsafe {
                    libc::ioctl(
                        fd.as_raw_fd(),
                        GPIO_GET_LINEHANDLE_IOCTL as _,
                        &mut req as *mut GpioHandleRequest,
                    )
                };
                (result, std::io::Error::last_os_error())
            };
            if result < 0 || req.fd < 0 {
                let reason = if err.raw_os_error() == Some(libc::EBUSY) {
                    "line is already claimed by another consumer".to_string()
                } else {
                    err.to_string()
                };
                return Err(WaveError::LineUnavailable { line, reason });
            }

            // SAFETY: the kernel returned a fresh descriptor that nothing else owns.
            let line_fd = unsafe { OwnedFd::from_raw_fd(req.fd) };

            info!(chip = %self.name, line, %initial, consumer, "GPIO line claimed as output");
            Ok(GpioLine {
                offset: line,
                fd: Mutex::new(Some(line_fd)),
                chip: self,
            })
        }

        /// Release the chip descriptor. Idempotent.
        pub fn close(&self) {
            if self.lock().take().is_some() {
                debug!(path = %self.path.display(), "GPIO chip closed");
            }
        }
    }

    /// A claimed output line.
    ///
    /// `set` calls from different threads are serialised on an internal
    /// mutex, which also makes `close` safe to race with a writer.
    #[derive(Debug)]
    pub struct GpioLine {
        offset: u32,
        fd: Mutex<Option<OwnedFd>>,
        chip: GpioChip,
    }

    impl GpioLine {
        pub(super) fn write(&self, value: Level) -> WaveResult<()> {
            let guard = self.fd.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(fd) = guard.as_ref() else {
                return Err(WaveError::Closed);
            };

            let mut data = GpioHandleData { values: [0; 64] };
            data.values[0] = value.as_u8();
            // SAFETY: `fd` is an open line handle and `data` matches the request size.
            let result = unsafe {
                libc::ioctl(
                    fd.as_raw_fd(),
                    GPIOHANDLE_SET_LINE_VALUES_IOCTL as _,
                    &mut data as *mut GpioHandleData,
                )
            };
            if result < 0 {
                return Err(WaveError::Io(format!(
                    "setting line {} to {value} failed: {}",
                    self.offset,
                    std::io::Error::last_os_error()
                )));
            }
            Ok(())
        }

        pub(super) fn release(&self) {
            let released = self
                .fd
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .is_some();
            if released {
                info!(chip = %self.chip.name, line = self.offset, "GPIO line released");
            }
            self.chip.close();
        }

        pub(super) fn holds_line(&self) -> bool {
            self.fd
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
        }
    }

    impl Drop for GpioLine {
        fn drop(&mut self) {
            if self.holds_line() {
                warn!(line = self.offset, "GPIO line dropped without close");
            }
        }
    }
}

/// Placeholder for non-Linux systems.
#[cfg(not(target_os = "linux"))]
mod imp {
    use super::{Level, Path, WaveError, WaveResult};

    /// GPIO chips are not available on this platform.
    #[derive(Debug)]
    pub struct GpioChip {
        _private: (),
    }

    impl GpioChip {
        /// Always fails on non-Linux platforms.
        pub fn open(path: &Path) -> WaveResult<Self> {
            Err(WaveError::HardwareUnavailable {
                device: path.display().to_string(),
                reason: "GPIO character devices are only available on Linux".into(),
            })
        }

        /// Always fails on non-Linux platforms.
        pub fn request_output(
            self,
            line: u32,
            _initial: Level,
            _consumer: &str,
        ) -> WaveResult<GpioLine> {
            Err(WaveError::LineUnavailable {
                line,
                reason: "not supported on this platform".into(),
            })
        }

        /// No-op on non-Linux.
        pub fn close(&self) {}
    }

    /// GPIO lines are not available on this platform.
    #[derive(Debug)]
    pub struct GpioLine {
        _private: (),
    }

    impl GpioLine {
        pub(super) fn write(&self, _value: Level) -> WaveResult<()> {
            Err(WaveError::Closed)
        }

        pub(super) fn release(&self) {}

        pub(super) fn holds_line(&self) -> bool {
            false
        }
    }
}

pub use imp::{GpioChip, GpioLine};

impl OutputSink for GpioLine {
    fn set(&self, value: Level) -> WaveResult<()> {
        self.write(value)
    }

    fn close(&self) -> WaveResult<()> {
        self.release();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.holds_line()
    }
}
