// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Datagram relay between the fast path and the userland control plane.
//!
//! Every datagram is `[protocol][address length][address][packet]`, the
//! protocol being the tunnel protocol number and the address its text
//! form: the link name for PPPoE, the peer IPv4 address for PPTP and the
//! peer socket address for L2TP. Towards userland the packet is what the
//! fast path did not keep; from userland it is a packet to send, with its
//! sequence numbers still in userland's numbering.

use super::Error;
use crate::context::{NetworkStack, PipexContext};
use crate::ip::{ipv4_header_checksum, IPPROTO_GRE, IPV4_MIN_HEADER_SIZE};
use crate::tunnel::{Protocol, Transmit};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

const ETHER_HEADER_LEN: usize = 14;

pub fn encode(protocol: Protocol, address: &str, packet: &[u8]) -> Vec<u8> {
    let address = &address.as_bytes()[..address.len().min(u8::MAX as usize)];
    let mut frame = Vec::with_capacity(2 + address.len() + packet.len());
    frame.push(protocol as u8);
    frame.push(address.len() as u8);
    frame.extend_from_slice(address);
    frame.extend_from_slice(packet);
    frame
}

pub fn decode(frame: &[u8]) -> Result<(Protocol, &str, &[u8]), Error> {
    if frame.len() < 2 {
        return Err(Error::Relay("short frame"));
    }
    let protocol = Protocol::from_u8(frame[0]).ok_or(Error::Relay("unknown protocol"))?;
    let end = 2 + frame[1] as usize;
    let address = frame
        .get(2..end)
        .and_then(|a| std::str::from_utf8(a).ok())
        .ok_or(Error::Relay("bad address"))?;
    Ok((protocol, address, &frame[end..]))
}

/// Wrap a GRE packet in an IPv4 header. The kernel fills in the source.
fn gre_datagram(dst: Ipv4Addr, gre: &[u8]) -> Vec<u8> {
    let total = (IPV4_MIN_HEADER_SIZE + gre.len()) as u16;
    let mut datagram = vec![0u8; IPV4_MIN_HEADER_SIZE];
    datagram[0] = 0x45;
    datagram[2..4].copy_from_slice(&total.to_be_bytes());
    datagram[8] = 64;
    datagram[9] = IPPROTO_GRE;
    datagram[16..20].copy_from_slice(&dst.octets());
    let cksum = ipv4_header_checksum(&datagram);
    datagram[10..12].copy_from_slice(&cksum.to_be_bytes());
    datagram.extend_from_slice(gre);
    datagram
}

/// Shift a userland packet into the fast path's numbering and build the
/// transmission for it.
pub fn userland_output(ctx: &PipexContext, frame: &[u8]) -> Result<Transmit, Error> {
    let (protocol, address, packet) = decode(frame)?;
    let mut packet = packet.to_vec();

    match protocol {
        Protocol::Pptp => {
            let dst: Ipv4Addr = address.parse().map_err(|_| Error::Relay("bad address"))?;
            ctx.pptp_userland_output(dst, &mut packet).map_err(Error::Packet)?;
            Ok(Transmit::Ipv4 {
                dst,
                datagram: gre_datagram(dst, &packet),
            })
        }
        Protocol::L2tp => {
            let dst: SocketAddr = address.parse().map_err(|_| Error::Relay("bad address"))?;
            ctx.l2tp_userland_output(dst, &mut packet).map_err(Error::Packet)?;
            let unspecified = match dst {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            Ok(Transmit::Udp {
                src: SocketAddr::new(unspecified, 0),
                dst,
                payload: packet,
            })
        }
        Protocol::Pppoe => {
            if packet.len() < ETHER_HEADER_LEN {
                return Err(Error::Relay("short frame"));
            }
            let mut dst = [0u8; 6];
            dst.copy_from_slice(&packet[..6]);
            Ok(Transmit::Ethernet {
                ifname: address.to_owned(),
                dst,
                ethertype: u16::from_be_bytes([packet[12], packet[13]]),
                payload: packet.split_off(ETHER_HEADER_LEN),
            })
        }
    }
}

pub struct Relay {
    sock: UnixDatagram,
    path: PathBuf,
    peer: Option<PathBuf>,
}

impl Relay {
    /// Bind our end at `path`. Packets for userland go to `peer`.
    pub fn bind(path: PathBuf, peer: Option<PathBuf>) -> Result<Relay, Error> {
        let _ = std::fs::remove_file(&path);
        let sock = UnixDatagram::bind(&path).map_err(Error::RelaySocket)?;
        sock.set_read_timeout(Some(Duration::from_millis(250)))
            .map_err(Error::RelaySocket)?;
        Ok(Relay { sock, path, peer })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Pass a packet the fast path did not keep to userland.
    pub fn forward(&self, protocol: Protocol, address: &str, packet: &[u8]) {
        let peer = match &self.peer {
            Some(peer) => peer,
            None => {
                tracing::trace!(message = "No relay peer, dropping control packet", %protocol);
                return;
            }
        };
        if let Err(e) = self.sock.send_to(&encode(protocol, address, packet), peer) {
            tracing::debug!(message = "Error: Relay send failed", %protocol, error = ?e);
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.sock.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn transmit(stack: &dyn NetworkStack, ctx: &PipexContext, frame: &[u8]) {
        let result = userland_output(ctx, frame).and_then(|t| stack.transmit(t).map_err(Error::IoError));
        if let Err(e) = result {
            tracing::debug!(message = "Error: Userland packet dropped", error = ?e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::RecordingStack;
    use crate::context::{PipexConfig, SessionRequest};
    use std::sync::Arc;

    #[test]
    fn frame_layout() {
        let frame = encode(Protocol::Pptp, "192.0.2.1", &[1, 2, 3]);
        assert_eq!(frame[..2], [2, 9]);
        assert_eq!(&frame[2..11], b"192.0.2.1");
        assert_eq!(decode(&frame).unwrap(), (Protocol::Pptp, "192.0.2.1", &[1u8, 2, 3][..]));

        assert!(decode(&[9, 0]).is_err());
        assert!(decode(&[1, 40, b'x']).is_err());
    }

    #[test]
    fn gre_header() {
        let datagram = gre_datagram(Ipv4Addr::new(192, 0, 2, 1), &[0x30, 0x01, 0x88, 0x0b]);
        let (ip, rest) = etherparse::Ipv4Header::from_slice(&datagram).unwrap();
        assert_eq!(ip.protocol, IPPROTO_GRE);
        assert_eq!(ip.destination, [192, 0, 2, 1]);
        assert_eq!(ip.header_checksum, ip.calc_header_checksum().unwrap());
        assert_eq!(rest, &[0x30, 0x01, 0x88, 0x0b]);
    }

    #[test]
    fn pppoe_discovery_passes_through() {
        let ctx = PipexContext::new(PipexConfig::default(), Arc::new(RecordingStack::default()));
        let mut frame = vec![2, 0, 0, 0, 0, 9, 2, 0, 0, 0, 0, 1, 0x88, 0x63];
        frame.extend_from_slice(&[0x11, 0x09, 0, 0, 0, 0]);
        let transmit = userland_output(&ctx, &encode(Protocol::Pppoe, "eth0", &frame)).unwrap();
        assert_eq!(
            transmit,
            Transmit::Ethernet {
                ifname: "eth0".into(),
                dst: [2, 0, 0, 0, 0, 9],
                ethertype: 0x8863,
                payload: vec![0x11, 0x09, 0, 0, 0, 0],
            }
        );
    }

    #[test]
    fn l2tp_numbers_are_shifted() {
        let ctx = PipexContext::new(PipexConfig::default(), Arc::new(RecordingStack::default()));
        let iface = ctx.iface_init("pipex0");
        ctx.set_mode(iface, true).unwrap();
        let req = SessionRequest {
            protocol: Protocol::L2tp as u8,
            session_id: 5,
            peer_session_id: 6,
            tunnel_id: 1,
            peer_tunnel_id: 2,
            l2tp_sequencing: true,
            peer_address: Some("192.0.2.1:1701".parse().unwrap()),
            local_address: Some("192.0.2.254:1701".parse().unwrap()),
            ip_address: Some(Ipv4Addr::new(10, 0, 0, 5)),
            ..Default::default()
        };
        ctx.add_session(iface, &req).unwrap();

        // The fast path sends one data packet of its own.
        ctx.ip_output(iface, vec![0x45, 0, 0, 20, 0, 0, 0, 0, 64, 17, 0, 0, 1, 1, 1, 1, 10, 0, 0, 5])
            .unwrap();
        ctx.softintr();

        // Userland's next Ns is still 0.
        let data = [0x08, 0x02, 0x00, 0x02, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0xff, 0x03, 0xc0, 0x21];
        let transmit = userland_output(&ctx, &encode(Protocol::L2tp, "192.0.2.1:1701", &data)).unwrap();
        match transmit {
            Transmit::Udp { dst, payload, .. } => {
                assert_eq!(dst, "192.0.2.1:1701".parse::<SocketAddr>().unwrap());
                assert_eq!(&payload[6..8], &1u16.to_be_bytes());
            }
            other => panic!("unexpected transmit {:?}", other),
        }
    }
}
