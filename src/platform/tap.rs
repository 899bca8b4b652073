//! Linux TAP device driver (§4.12), behind the `tap` feature. Opens
//! `/dev/net/tun` in `IFF_TAP | IFF_NO_PI` mode via raw `libc` ioctls —
//! this is the intended way to exercise the stack against real traffic,
//! the way `tapstackd` (§4.13) wires one to a [`crate::Stack`].
//!
//! This file is deliberately thin: it is frame I/O only, no protocol
//! logic, matching the Design Note that driver/platform shims should not
//! leak into the core.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;

use crate::error::{Result, StackError};
use crate::platform::{L2Driver, LinkState};

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[repr(C)]
struct IfReq {
    name: [libc::c_char; 16],
    flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct TapDevice {
    file: File,
    name: String,
}

impl TapDevice {
    /// Opens (creating if necessary) the TAP device named `name`, e.g.
    /// `"tap0"`. Requires `CAP_NET_ADMIN` (typically root).
    pub fn open(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open("/dev/net/tun")?;

        let mut req = IfReq {
            name: [0; 16],
            flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (i, b) in name.bytes().take(15).enumerate() {
            req.name[i] = b as libc::c_char;
        }

        // SAFETY: `req` is a valid, correctly-sized `ifreq` for
        // `TUNSETIFF`; the fd is open for the duration of this call.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &req as *const IfReq) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(TapDevice { file, name: name.to_string() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Duplicates the underlying fd so the caller can hold one handle for
    /// reading and hand a second one to [`crate::Stack::add_interface`]
    /// for writing — the kernel doesn't care which fd a TAP read/write
    /// comes in on, so `dup(2)` is all a second handle needs.
    pub fn try_clone(&self) -> io::Result<TapDevice> {
        Ok(TapDevice {
            file: self.file.try_clone()?,
            name: self.name.clone(),
        })
    }

    /// Puts the device in non-blocking mode, so [`Self::recv_frame`] can be
    /// polled from an event loop that also has timers to service. File
    /// status flags are shared by every fd `dup`'d from this one (via
    /// [`Self::try_clone`]), so this only needs calling once.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        // SAFETY: `fd` is open for the duration of this call; F_GETFL/
        // F_SETFL never touch memory beyond the fd table entry itself.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Non-blocking-ish read of one frame. Returns `Ok(None)` if nothing
    /// is currently available. Requires [`Self::set_nonblocking`] to have
    /// been called (on this handle or one it was cloned from), otherwise
    /// a read with nothing to return blocks the whole event loop.
    pub fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.file.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl L2Driver for TapDevice {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.file.write_all(frame).map_err(|_| StackError::NoHeaderSpace)
    }

    fn link_state(&self) -> LinkState {
        // A TAP device has no physical carrier to sense; treat it as
        // always up once open, matching how the host kernel treats it.
        LinkState::Up
    }
}
