// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Just enough IP header inspection for session routing, idle accounting
//! and TCP MSS clamping.

use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr};

pub const IPV4_MIN_HEADER_SIZE: usize = 20;
const IPV4_FRAG_OFF: usize = 6;
const IPV4_PROTO_OFF: usize = 9;
const IPV4_SRC_IP_OFF: usize = 12;
const IPV4_DST_IP_OFF: usize = 16;
const IPV4_IP_SZ: usize = 4;

const IPV6_MIN_HEADER_SIZE: usize = 40;
const IPV6_SRC_IP_OFF: usize = 8;
const IPV6_DST_IP_OFF: usize = 24;
const IPV6_IP_SZ: usize = 16;

const IP_MF: u16 = 0x2000;
const IP_OFFMASK: u16 = 0x1fff;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_IGMP: u8 = 2;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_GRE: u8 = 47;

const ICMP_ECHOREPLY: u8 = 0;
const ICMP_ECHO: u8 = 8;

/// DNS, BOOTP server and client, NTP, NetBIOS name service, RIP.
const IDLE_PORTS: [u16; 6] = [53, 67, 68, 123, 137, 520];

const TCP_MIN_HEADER_SIZE: usize = 20;
const TCP_FLAGS_OFF: usize = 13;
const TCP_CSUM_OFF: usize = 16;
const TH_SYN: u8 = 0x02;
const TCPOPT_EOL: u8 = 0;
const TCPOPT_NOP: u8 = 1;
const TCPOPT_MAXSEG: u8 = 2;
const TCPOLEN_MAXSEG: usize = 4;
/// Room left for a timestamp option when deriving the MSS from an MRU.
const TCP_OPTLEN_IN_SEGMENT: u16 = 12;
const MSS_OVERHEAD: u16 = (IPV4_MIN_HEADER_SIZE + TCP_MIN_HEADER_SIZE) as u16 + TCP_OPTLEN_IN_SEGMENT;

fn ipv4_header_len(packet: &[u8]) -> Option<usize> {
    if packet.len() < IPV4_MIN_HEADER_SIZE || packet[0] >> 4 != 4 {
        return None;
    }
    let hlen = ((packet[0] & 0x0f) as usize) * 4;
    if hlen < IPV4_MIN_HEADER_SIZE || hlen > packet.len() {
        return None;
    }
    Some(hlen)
}

fn is_fragment(packet: &[u8]) -> bool {
    let off = u16::from_be_bytes([packet[IPV4_FRAG_OFF], packet[IPV4_FRAG_OFF + 1]]);
    off & IP_MF != 0 || off & IP_OFFMASK != 0
}

pub fn dst_address(packet: &[u8]) -> Option<IpAddr> {
    address_at(packet, IPV4_DST_IP_OFF, IPV6_DST_IP_OFF)
}

pub fn src_address(packet: &[u8]) -> Option<IpAddr> {
    address_at(packet, IPV4_SRC_IP_OFF, IPV6_SRC_IP_OFF)
}

fn address_at(packet: &[u8], v4_off: usize, v6_off: usize) -> Option<IpAddr> {
    if packet.is_empty() {
        return None;
    }

    match packet[0] >> 4 {
        4 if packet.len() >= IPV4_MIN_HEADER_SIZE => {
            let addr_bytes: [u8; IPV4_IP_SZ] =
                packet[v4_off..v4_off + IPV4_IP_SZ].try_into().ok()?;
            Some(IpAddr::from(addr_bytes))
        }
        6 if packet.len() >= IPV6_MIN_HEADER_SIZE => {
            let addr_bytes: [u8; IPV6_IP_SZ] =
                packet[v6_off..v6_off + IPV6_IP_SZ].try_into().ok()?;
            Some(IpAddr::from(addr_bytes))
        }
        _ => None,
    }
}

/// Whether a packet should leave the idle timer alone. Only IPv4 has a
/// notion of idle traffic; everything else counts as activity.
pub fn is_idle_packet(packet: &[u8]) -> bool {
    let hlen = match ipv4_header_len(packet) {
        Some(hlen) => hlen,
        None => return false,
    };

    if is_fragment(packet) {
        return false;
    }

    let l4 = &packet[hlen..];
    match packet[IPV4_PROTO_OFF] {
        IPPROTO_IGMP => false,
        IPPROTO_ICMP => match l4.first() {
            Some(&ICMP_ECHOREPLY) | Some(&ICMP_ECHO) => false,
            Some(_) => true,
            None => false,
        },
        IPPROTO_UDP | IPPROTO_TCP if l4.len() >= 4 => {
            let sport = u16::from_be_bytes([l4[0], l4[1]]);
            let dport = u16::from_be_bytes([l4[2], l4[3]]);
            IDLE_PORTS.contains(&sport) || IDLE_PORTS.contains(&dport)
        }
        _ => false,
    }
}

/// Whether `packet`'s source lies inside `network`. Non IPv4 packets pass.
pub fn ingress_allowed(packet: &[u8], network: &ip_network::Ipv4Network) -> bool {
    match src_address(packet) {
        Some(IpAddr::V4(src)) => network.contains(src),
        _ => true,
    }
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Incrementally update an internet checksum after a 16-bit word changed
/// from `old` to `new`.
pub fn adjust_checksum(cksum: u16, old: u16, new: u16) -> u16 {
    !fold((!cksum) as u32 + (!old) as u32 + new as u32)
}

pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let sum = header
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]) as u32)
        .sum();
    !fold(sum)
}

/// Rewrite the MSS option of an outgoing TCP SYN so segments fit `mru`.
/// Returns true if the packet was changed.
pub fn clamp_tcp_mss(packet: &mut [u8], mru: u16) -> bool {
    // No usable MRU, nothing to clamp to.
    if mru <= MSS_OVERHEAD {
        return false;
    }

    let hlen = match ipv4_header_len(packet) {
        Some(hlen) => hlen,
        None => return false,
    };

    // Non TCP or fragmented packets have no MSS to adjust.
    if packet[IPV4_PROTO_OFF] != IPPROTO_TCP || is_fragment(packet) {
        return false;
    }

    let tcp = &mut packet[hlen..];
    if tcp.len() < TCP_MIN_HEADER_SIZE || tcp[TCP_FLAGS_OFF] & TH_SYN == 0 {
        return false;
    }

    let doff = ((tcp[12] >> 4) as usize) * 4;
    let opt_end = doff.min(tcp.len());
    let maxmss = mru - MSS_OVERHEAD;

    let mut i = TCP_MIN_HEADER_SIZE;
    while i < opt_end {
        match tcp[i] {
            TCPOPT_EOL => return false,
            TCPOPT_NOP => i += 1,
            TCPOPT_MAXSEG => {
                if i + TCPOLEN_MAXSEG > opt_end || tcp[i + 1] as usize != TCPOLEN_MAXSEG {
                    return false;
                }
                let mss = u16::from_be_bytes([tcp[i + 2], tcp[i + 3]]);
                if mss <= maxmss {
                    return false;
                }
                tracing::trace!("Info: Clamping TCP MSS {} => {}", mss, maxmss);
                tcp[i + 2..i + 4].copy_from_slice(&maxmss.to_be_bytes());
                let cksum = u16::from_be_bytes([tcp[TCP_CSUM_OFF], tcp[TCP_CSUM_OFF + 1]]);
                let cksum = adjust_checksum(cksum, mss, maxmss);
                tcp[TCP_CSUM_OFF..TCP_CSUM_OFF + 2].copy_from_slice(&cksum.to_be_bytes());
                return true;
            }
            _ => {
                let optlen = *tcp.get(i + 1).unwrap_or(&0) as usize;
                if optlen < 2 {
                    return false;
                }
                i += optlen;
            }
        }
    }
    false
}

pub fn is_multicast(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => a.is_multicast() || a == Ipv4Addr::BROADCAST,
        IpAddr::V6(a) => a.is_multicast(),
    }
}
