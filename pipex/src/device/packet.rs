// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! AF_PACKET sockets carrying PPPoE session frames.

use super::poll_readable;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Index of the link called `ifname`, if there is one.
pub fn ifindex(ifname: &str) -> Option<i32> {
    let name = CString::new(ifname).ok()?;
    match unsafe { libc::if_nametoindex(name.as_ptr()) } {
        0 => None,
        index => Some(index as i32),
    }
}

fn link_address(ifindex: i32, ethertype: u16, dst: Option<[u8; 6]>) -> libc::sockaddr_ll {
    let mut sll_addr = [0u8; 8];
    if let Some(dst) = dst {
        sll_addr[..6].copy_from_slice(&dst);
    }
    libc::sockaddr_ll {
        sll_family: libc::AF_PACKET as u16,
        sll_protocol: ethertype.to_be(),
        sll_ifindex: ifindex,
        sll_hatype: 0,
        sll_pkttype: 0,
        sll_halen: if dst.is_some() { 6 } else { 0 },
        sll_addr,
    }
}

#[derive(Debug)]
pub struct PacketSocket {
    fd: OwnedFd,
}

impl PacketSocket {
    fn open(kind: libc::c_int, ethertype: u16) -> io::Result<PacketSocket> {
        let fd = unsafe { libc::socket(libc::AF_PACKET, kind, ethertype.to_be() as libc::c_int) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(PacketSocket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Receive whole Ethernet frames of `ethertype` arriving on `ifname`.
    pub fn bind(ifname: &str, ethertype: u16) -> io::Result<PacketSocket> {
        let index = ifindex(ifname)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such link {}", ifname)))?;
        let sock = PacketSocket::open(libc::SOCK_RAW, ethertype)?;
        let addr = link_address(index, ethertype, None);
        let ret = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sock)
    }

    /// An unbound socket that sends payloads and lets the kernel build the
    /// link header.
    pub fn sender() -> io::Result<PacketSocket> {
        PacketSocket::open(libc::SOCK_DGRAM, 0)
    }

    pub fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if !poll_readable(self.as_raw_fd(), timeout)? {
            return Ok(None);
        }
        let n = unsafe { libc::recv(self.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            let e = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(e),
            };
        }
        Ok(Some(n as usize))
    }

    pub fn send_to(&self, ifname: &str, dst: [u8; 6], ethertype: u16, payload: &[u8]) -> io::Result<usize> {
        let index = ifindex(ifname)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such link {}", ifname)))?;
        let addr = link_address(index, ethertype, Some(dst));
        let n = unsafe {
            libc::sendto(
                self.as_raw_fd(),
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for PacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
