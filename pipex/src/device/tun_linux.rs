// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use super::{poll_readable, Error};
use libc::{c_char, c_short, c_void, ioctl, open, read, write, IFF_NO_PI, IFF_TUN, O_RDWR};
use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// The TUN interface pipex hands decapsulated packets to, and reads
/// routed packets from.
#[derive(Debug)]
pub struct TunSocket {
    fd: OwnedFd,
    name: String,
}

impl TunSocket {
    pub fn new(name: &str) -> Result<TunSocket, Error> {
        if name.is_empty() || name.len() >= IFNAMSIZ || name.contains('\0') {
            return Err(Error::InvalidTunnelName);
        }

        let fd = unsafe { open(b"/dev/net/tun\0".as_ptr() as *const c_char, O_RDWR) };
        if fd < 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }
        // Owned from here on so every error path closes it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: (IFF_TUN | IFF_NO_PI) as c_short,
            _pad: [0; 22],
        };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
            *dst = src as c_char;
        }

        if unsafe { ioctl(fd.as_raw_fd(), TUNSETIFF as _, &mut ifr as *mut IfReq as *mut c_void) } < 0 {
            return Err(Error::IOCtl(io::Error::last_os_error()));
        }

        let name = unsafe { CStr::from_ptr(ifr.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        tracing::info!(message = "Info: TUN interface created", name = %name);
        Ok(TunSocket { fd, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one packet, or `Ok(None)` when nothing arrived within `timeout`.
    pub fn read_timeout<'a>(&self, buf: &'a mut [u8], timeout: Duration) -> Result<Option<&'a [u8]>, Error> {
        if !poll_readable(self.as_raw_fd(), timeout).map_err(Error::IfaceRead)? {
            return Ok(None);
        }
        let n = unsafe { read(self.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            let e = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(Error::IfaceRead(e)),
            };
        }
        Ok(Some(&buf[..n as usize]))
    }

    pub fn write(&self, packet: &[u8]) -> io::Result<usize> {
        let n = unsafe { write(self.as_raw_fd(), packet.as_ptr() as *const c_void, packet.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for TunSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
