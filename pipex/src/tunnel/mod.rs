// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Tunnel codecs. Each one strips its own header from inbound packets,
//! keeps the sequence bookkeeping the fast path shares with userland, and
//! wraps outbound PPP frames for the wire.

pub mod errors;
pub mod l2tp;
pub mod pppoe;
pub mod pptp;
pub mod seq;

use errors::PacketError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Range;

pub use l2tp::L2tpSession;
pub use pppoe::PppoeSession;
pub use pptp::PptpSession;

/// Tunnel protocol numbers as the control plane sends them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    L2tp = 1,
    Pptp = 2,
    Pppoe = 3,
}

impl Protocol {
    pub fn from_u8(value: u8) -> Option<Protocol> {
        match value {
            1 => Some(Protocol::L2tp),
            2 => Some(Protocol::Pptp),
            3 => Some(Protocol::Pppoe),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::L2tp => "L2TP",
            Protocol::Pptp => "PPTP",
            Protocol::Pppoe => "PPPoE",
        })
    }
}

impl std::str::FromStr for Protocol {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l2tp" => Ok(Protocol::L2tp),
            "pptp" => Ok(Protocol::Pptp),
            "pppoe" => Ok(Protocol::Pppoe),
            other => other
                .parse::<u8>()
                .ok()
                .and_then(Protocol::from_u8)
                .ok_or("Error: Unknown tunnel protocol"),
        }
    }
}

/// A packet ready for the wire, addressed the way its tunnel needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transmit {
    /// Ethernet payload for `ifname`. The link layer adds its own source.
    Ethernet {
        ifname: String,
        dst: [u8; 6],
        ethertype: u16,
        payload: Vec<u8>,
    },
    /// A complete IPv4 datagram, header included.
    Ipv4 { dst: Ipv4Addr, datagram: Vec<u8> },
    Udp {
        src: SocketAddr,
        dst: SocketAddr,
        payload: Vec<u8>,
    },
}

/// A sequence or acknowledgement number found in an inbound header,
/// remembered so it can be rewritten if the packet goes to userland.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqField {
    pub offset: usize,
    pub value: u32,
}

/// What a codec learned from an inbound packet.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// The PPP frame inside the packet. `None` means the packet can only
    /// go to userland (control messages, bare acknowledgements).
    pub frame: Option<Range<usize>>,
    /// How far the packet moved the receive edge.
    pub advance: u32,
    /// Sequence number behind the receive edge but inside the rewind window.
    pub rewind: bool,
    /// The unacknowledged span crossed half the window.
    pub send_ack: bool,
    pub seq: Option<SeqField>,
    pub ack: Option<SeqField>,
}

/// Identifiers a codec needs to address the peer.
#[derive(Debug, Clone, Copy)]
pub struct SessionIds {
    pub session_id: u16,
    pub peer_session_id: u16,
}

pub trait TunnelCodec {
    /// Parse an inbound packet already matched to this session and update
    /// the acknowledgement state. Sequence gaps are settled later by
    /// `accept` or `restore`.
    fn decode(&mut self, packet: &[u8]) -> Result<Inbound, PacketError>;

    /// The fast path kept the frame.
    fn accept(&mut self, _inbound: &Inbound) {}

    /// The packet goes to userland: translate its numbers into the
    /// sequence space userland knows.
    fn restore(&mut self, _inbound: &Inbound, _packet: &mut [u8]) {}

    /// Wrap a PPP frame for the wire.
    fn encode(&mut self, ids: SessionIds, frame: &[u8]) -> Transmit;

    /// A bare acknowledgement, for tunnels that sequence their data.
    fn ack(&mut self, _ids: SessionIds) -> Option<Transmit> {
        None
    }

    /// Translate a userland originated packet into the wire's sequence space.
    fn userland_output(&mut self, _packet: &mut [u8]) -> Result<(), PacketError> {
        Ok(())
    }

    /// Whether PPP frames on this tunnel carry the address/control field.
    fn has_acf(&self) -> bool {
        true
    }
}

/// Per protocol session state.
#[derive(Debug)]
pub enum Tunnel {
    Pppoe(PppoeSession),
    Pptp(PptpSession),
    L2tp(L2tpSession),
}

impl Tunnel {
    pub fn protocol(&self) -> Protocol {
        match self {
            Tunnel::Pppoe(_) => Protocol::Pppoe,
            Tunnel::Pptp(_) => Protocol::Pptp,
            Tunnel::L2tp(_) => Protocol::L2tp,
        }
    }

    pub fn codec(&mut self) -> &mut dyn TunnelCodec {
        match self {
            Tunnel::Pppoe(s) => s,
            Tunnel::Pptp(s) => s,
            Tunnel::L2tp(s) => s,
        }
    }

    pub fn has_acf(&self) -> bool {
        match self {
            Tunnel::Pppoe(s) => s.has_acf(),
            Tunnel::Pptp(s) => s.has_acf(),
            Tunnel::L2tp(s) => s.has_acf(),
        }
    }

    /// Where the peer lives, for the peer address index.
    pub fn peer_address(&self) -> Option<std::net::IpAddr> {
        match self {
            Tunnel::Pppoe(_) => None,
            Tunnel::Pptp(s) => Some(s.peer_address.into()),
            Tunnel::L2tp(s) => Some(s.peer_address.ip()),
        }
    }
}

/// Clip `range` to what `packet` actually holds.
pub(crate) fn frame_range(start: usize, len: usize, packet: &[u8]) -> Result<Range<usize>, PacketError> {
    let end = start.checked_add(len).ok_or(PacketError::IncorrectPacketLength)?;
    if end > packet.len() {
        return Err(PacketError::IncorrectPacketLength);
    }
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names() {
        assert_eq!("pppoe".parse::<Protocol>(), Ok(Protocol::Pppoe));
        assert_eq!("PPTP".parse::<Protocol>(), Ok(Protocol::Pptp));
        assert_eq!("1".parse::<Protocol>(), Ok(Protocol::L2tp));
        assert!("9".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Pppoe.to_string(), "PPPoE");
    }
}
