//! eventfd-backed counting semaphore used to wake the polling thread.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// A non-blocking, close-on-exec eventfd.
///
/// `signal(n)` adds `n` to a 64-bit kernel counter; `take()` reads and zeroes
/// it. Closed exactly once, when dropped.
#[derive(Debug)]
pub struct WakeupFd {
    fd: OwnedFd,
}

const COUNTER_LEN: usize = std::mem::size_of::<u64>();

impl WakeupFd {
    pub fn new() -> io::Result<Self> {
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: eventfd just returned this descriptor; nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Add `n` to the counter.
    ///
    /// Fails with `WouldBlock` if the counter would pass `u64::MAX - 1`, and
    /// with `InvalidInput` for `n == u64::MAX`.
    pub fn signal(&self, n: u64) -> io::Result<()> {
        let buf = n.to_ne_bytes();
        let written = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), COUNTER_LEN) };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        if written as usize != COUNTER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to eventfd",
            ));
        }
        Ok(())
    }

    /// Read the counter and reset it to zero.
    ///
    /// Fails with `WouldBlock` when the counter is already zero.
    pub fn take(&self) -> io::Result<u64> {
        let mut buf = [0u8; COUNTER_LEN];
        let read = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), COUNTER_LEN) };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        if read as usize != COUNTER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from eventfd",
            ));
        }
        Ok(u64::from_ne_bytes(buf))
    }
}

impl AsRawFd for WakeupFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for WakeupFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
