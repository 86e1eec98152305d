// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use super::{Error, IfaceId, NetworkStack};
use crate::ppp::ccp::CcpMessage;
use crate::ppp::mppe::{Mppe, MppeRequest};
use crate::ppp::{mppe_inner, Framing, PppFlags, PPP_CCP, PPP_COMP, PPP_IP, PPP_IPV6};
use crate::tunnel::{L2tpSession, PppoeSession, PptpSession, Protocol, SessionIds, Tunnel};
use ip_network::{Ipv4Network, Ipv6Network};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Opened,
    /// Timed out or told to close; waiting for the control plane to notice.
    CloseWait,
    /// Reported by `get_closed`, still aging.
    CloseWait2,
    Closed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub ipackets: u64,
    pub ierrors: u64,
    pub ibytes: u64,
    pub opackets: u64,
    pub oerrors: u64,
    pub obytes: u64,
    pub idle_time: u32,
}

/// Everything the control plane says about a session it wants on the
/// fast path. Protocol specific fields are ignored by the other protocols.
#[derive(Debug, Default, Clone)]
pub struct SessionRequest {
    pub protocol: u8,
    pub session_id: u16,
    pub peer_session_id: u16,
    pub ppp_id: u32,
    pub ppp_flags: PppFlags,
    pub peer_mru: u16,
    pub timeout_sec: u32,

    pub ip_address: Option<Ipv4Addr>,
    pub ip_netmask: Option<Ipv4Addr>,
    pub ip6_network: Option<Ipv6Network>,
    pub ip_forward: Option<bool>,
    pub ip6_forward: Option<bool>,

    // PPTP and L2TP
    pub local_address: Option<SocketAddr>,
    pub peer_address: Option<SocketAddr>,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub rcv_acked: u32,
    pub winsz: u16,
    pub maxwinsz: u16,
    pub peer_maxwinsz: u16,

    // L2TP
    pub tunnel_id: u16,
    pub peer_tunnel_id: u16,
    pub l2tp_sequencing: bool,

    // PPPoE
    pub over_ifname: Option<String>,
    pub peer_mac: Option<[u8; 6]>,

    pub mppe_send: Option<MppeRequest>,
    pub mppe_recv: Option<MppeRequest>,
}

#[derive(Debug)]
pub struct Session {
    pub session_id: u16,
    pub peer_session_id: u16,
    pub ppp_id: u32,
    pub iface: IfaceId,
    pub state: SessionState,
    pub flags: PppFlags,
    pub peer_mru: u16,
    pub timeout_sec: u32,
    pub ip_address: Option<Ipv4Network>,
    pub ip6_network: Option<Ipv6Network>,
    pub ip_forward: bool,
    pub ip6_forward: bool,
    pub tunnel: Tunnel,
    pub mppe_send: Option<Mppe>,
    pub mppe_recv: Option<Mppe>,
    pub stats: SessionStats,
    /// Statistics at the moment the session was closed.
    pub closed_stats: Option<SessionStats>,
    ccp_id: u8,
}

fn host_network(addr: Ipv4Addr, netmask: Option<Ipv4Addr>) -> Result<Ipv4Network, Error> {
    let mask = u32::from(netmask.unwrap_or(Ipv4Addr::UNSPECIFIED));
    let prefix = if mask == 0 {
        32
    } else if mask.leading_ones() + mask.trailing_zeros() == 32 {
        mask.leading_ones() as u8
    } else {
        return Err(Error::InvalidArgument("non contiguous netmask"));
    };
    Ipv4Network::new_truncate(addr, prefix).map_err(|_| Error::InvalidArgument("ip_address"))
}

fn mppe_direction(
    flags: PppFlags,
    flag: PppFlags,
    req: &Option<MppeRequest>,
    receiver: bool,
) -> Result<Option<Mppe>, Error> {
    if !flags.contains(flag) {
        return Ok(None);
    }
    let req = req.as_ref().ok_or(Error::InvalidArgument("missing MPPE key"))?;
    Mppe::new(req, receiver)
        .map(Some)
        .map_err(|_| Error::InvalidArgument("MPPE key length"))
}

impl Session {
    /// Validate a request and build the session it describes. Nothing is
    /// registered here.
    pub fn from_request(iface: IfaceId, req: &SessionRequest, stack: &dyn NetworkStack) -> Result<Session, Error> {
        let protocol = Protocol::from_u8(req.protocol).ok_or(Error::UnsupportedProtocol(req.protocol))?;

        let tunnel = match protocol {
            Protocol::Pppoe => {
                if req.local_address.is_some() || req.peer_address.is_some() {
                    return Err(Error::InvalidArgument("PPPoE takes no tunnel addresses"));
                }
                let ifname = req
                    .over_ifname
                    .as_ref()
                    .filter(|name| !name.is_empty() && stack.link_exists(name))
                    .ok_or(Error::InvalidArgument("over_ifname"))?;
                let peer_mac = req.peer_mac.ok_or(Error::InvalidArgument("peer_mac"))?;
                Tunnel::Pppoe(PppoeSession::new(ifname.clone(), peer_mac))
            }
            Protocol::Pptp => match (req.peer_address, req.local_address) {
                (Some(SocketAddr::V4(peer)), Some(SocketAddr::V4(local))) => Tunnel::Pptp(PptpSession::new(
                    *peer.ip(),
                    *local.ip(),
                    req.snd_una,
                    req.snd_nxt,
                    req.rcv_nxt,
                    req.rcv_acked,
                    req.winsz,
                    req.maxwinsz,
                    req.peer_maxwinsz,
                )),
                _ => return Err(Error::InvalidArgument("PPTP needs IPv4 peer and local addresses")),
            },
            Protocol::L2tp => match (req.peer_address, req.local_address) {
                (Some(peer), Some(local)) if peer.is_ipv4() == local.is_ipv4() => {
                    Tunnel::L2tp(L2tpSession::new(
                        local,
                        peer,
                        req.tunnel_id,
                        req.peer_tunnel_id,
                        req.snd_una as u16,
                        req.snd_nxt as u16,
                        req.rcv_nxt as u16,
                        req.rcv_acked as u16,
                        req.winsz,
                        req.l2tp_sequencing,
                    ))
                }
                _ => return Err(Error::InvalidArgument("L2TP needs peer and local addresses of one family")),
            },
        };

        let flags = req.ppp_flags;
        if flags.contains(PppFlags::MPPE_REQUIRED)
            && !flags.contains(PppFlags::MPPE_ENABLED | PppFlags::MPPE_ACCEPTED)
        {
            return Err(Error::InvalidArgument("MPPE required but not negotiated"));
        }
        let mppe_recv = mppe_direction(flags, PppFlags::MPPE_ACCEPTED, &req.mppe_recv, true)?;
        let mppe_send = mppe_direction(flags, PppFlags::MPPE_ENABLED, &req.mppe_send, false)?;

        let ip_address = req
            .ip_address
            .filter(|a| !a.is_unspecified())
            .map(|a| host_network(a, req.ip_netmask))
            .transpose()?;

        Ok(Session {
            session_id: req.session_id,
            peer_session_id: req.peer_session_id,
            ppp_id: req.ppp_id,
            iface,
            state: SessionState::Opened,
            flags,
            peer_mru: req.peer_mru,
            timeout_sec: req.timeout_sec,
            ip_forward: req.ip_forward.unwrap_or(ip_address.is_some()),
            ip6_forward: req.ip6_forward.unwrap_or(req.ip6_network.is_some()),
            ip_address,
            ip6_network: req.ip6_network,
            tunnel,
            mppe_send,
            mppe_recv,
            stats: SessionStats::default(),
            closed_stats: None,
            ccp_id: 0,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.tunnel.protocol()
    }

    pub fn ids(&self) -> SessionIds {
        SessionIds {
            session_id: self.session_id,
            peer_session_id: self.peer_session_id,
        }
    }

    pub fn framing(&self) -> Framing {
        Framing {
            has_acf: self.tunnel.has_acf(),
            flags: self.flags,
        }
    }

    pub fn peer_address(&self) -> Option<IpAddr> {
        self.tunnel.peer_address()
    }

    /// Whether the fast path forwards traffic of this address family.
    pub fn forwards(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(_) => self.ip_forward,
            IpAddr::V6(_) => self.ip6_forward,
        }
    }

    /// A MPPE receiver that depends on every frame arriving in order.
    pub fn stateful_mppe_recv(&self) -> bool {
        self.mppe_recv.as_ref().map_or(false, |m| !m.is_stateless())
    }

    pub fn snapshot(&self) -> SessionStats {
        self.stats
    }

    /// Encapsulate `payload` as PPP `protocol` and send it. IP traffic is
    /// encrypted first when MPPE is on for the send direction.
    pub fn output(&mut self, stack: &dyn NetworkStack, protocol: u16, payload: &[u8]) {
        let framing = self.framing();
        let frame = match self.mppe_send.as_mut() {
            Some(mppe) if protocol == PPP_IP || protocol == PPP_IPV6 => {
                let sealed = mppe.encrypt(&mppe_inner(protocol, payload));
                framing.encapsulate(PPP_COMP, &sealed)
            }
            _ => framing.encapsulate(protocol, payload),
        };

        let ids = self.ids();
        let transmit = self.tunnel.codec().encode(ids, &frame);
        match stack.transmit(transmit) {
            Ok(()) => {
                self.stats.opackets += 1;
                self.stats.obytes += payload.len() as u64;
            }
            Err(e) => {
                self.stats.oerrors += 1;
                tracing::debug!(message = "Error: transmit failed", session_id = self.session_id, error = ?e);
            }
        }
    }

    /// Ask the peer to flush its MPPE state.
    pub fn send_ccp_reset_request(&mut self, stack: &dyn NetworkStack) {
        let id = self.ccp_id;
        self.ccp_id = self.ccp_id.wrapping_add(1);
        tracing::debug!(message = "Sending CCP Reset-Request", session_id = self.session_id, id);
        self.output(stack, PPP_CCP, &CcpMessage::ResetRequest { id }.encode());
    }

    pub fn send_ccp_reset_ack(&mut self, stack: &dyn NetworkStack, id: u8) {
        self.output(stack, PPP_CCP, &CcpMessage::ResetAck { id }.encode());
    }
}
