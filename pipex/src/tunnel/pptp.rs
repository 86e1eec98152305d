// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! PPTP data channel: enhanced GRE (version 1) over IPv4.
//!
//! The fast path and the control daemon share one sequence space on the
//! wire. Numbers the fast path consumed or produced are tracked as gaps so
//! that packets passed to or received from userland can be shifted into
//! the space the daemon believes in.

use super::errors::PacketError;
use super::seq::{classify32, seq32_gt, seq32_lt, seq32_sub, SeqPosition};
use super::{frame_range, Inbound, SeqField, SessionIds, Transmit, TunnelCodec};
use crate::ip::{ipv4_header_checksum, IPPROTO_GRE, IPV4_MIN_HEADER_SIZE};
use crate::ppp::PPP_MIN_LEN;
use std::net::Ipv4Addr;

pub const GRE_HEADER_LEN: usize = 8;
pub const GRE_PROTOCOL_PPP: u16 = 0x880b;

const GRE_FLAG_S: u16 = 0x1000;
const GRE_FLAG_K: u16 = 0x2000;
const GRE_FLAG_A: u16 = 0x0080;
const GRE_VERSION_MASK: u16 = 0x0007;
const GRE_VERSION: u16 = 0x0001;

const IP_TTL_MAX: u8 = 255;

// Offsets inside the GRE header
const GRE_FLAGS_OFF: usize = 0;
const GRE_TYPE_OFF: usize = 2;
const GRE_LEN_OFF: usize = 4;
const GRE_CALL_ID_OFF: usize = 6;

#[derive(Debug, Clone)]
pub struct PptpSession {
    pub peer_address: Ipv4Addr,
    pub our_address: Ipv4Addr,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub rcv_acked: u32,
    pub snd_gap: u32,
    pub rcv_gap: u32,
    pub ul_snd_una: u32,
    pub winsz: u16,
    pub maxwinsz: u16,
    pub peer_maxwinsz: u16,
    ip_id: u16,
}

/// The parts of a GRE header the session lookup needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreKey {
    pub flags: u16,
    pub call_id: u16,
}

fn be16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

fn be32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn put32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

/// Validate a GRE header and pull out its call id.
pub fn parse_gre(gre: &[u8]) -> Result<GreKey, PacketError> {
    if gre.len() < GRE_HEADER_LEN {
        return Err(PacketError::PacketTooShort);
    }
    let flags = be16(gre, GRE_FLAGS_OFF);
    if flags & GRE_VERSION_MASK != GRE_VERSION {
        return Err(PacketError::WrongVersion);
    }
    if flags & GRE_FLAG_K == 0 {
        return Err(PacketError::MissingKeyFlag);
    }
    if be16(gre, GRE_TYPE_OFF) != GRE_PROTOCOL_PPP {
        return Err(PacketError::WrongPacketType);
    }
    Ok(GreKey {
        flags,
        call_id: be16(gre, GRE_CALL_ID_OFF),
    })
}

/// Source address, IP header length and GRE key of an inbound datagram.
pub fn lookup_key(datagram: &[u8]) -> Result<(Ipv4Addr, usize, GreKey), PacketError> {
    if datagram.len() < IPV4_MIN_HEADER_SIZE + GRE_HEADER_LEN {
        return Err(PacketError::PacketTooShort);
    }
    if datagram[0] >> 4 != 4 {
        return Err(PacketError::WrongVersion);
    }
    let ihl = ((datagram[0] & 0x0f) as usize) * 4;
    if ihl < IPV4_MIN_HEADER_SIZE || datagram.len() < ihl + GRE_HEADER_LEN {
        return Err(PacketError::IncorrectPacketLength);
    }
    if datagram[9] != IPPROTO_GRE {
        return Err(PacketError::WrongPacketType);
    }
    let src = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);
    Ok((src, ihl, parse_gre(&datagram[ihl..])?))
}

impl PptpSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_address: Ipv4Addr,
        our_address: Ipv4Addr,
        snd_una: u32,
        snd_nxt: u32,
        rcv_nxt: u32,
        rcv_acked: u32,
        winsz: u16,
        maxwinsz: u16,
        peer_maxwinsz: u16,
    ) -> PptpSession {
        PptpSession {
            peer_address,
            our_address,
            snd_una,
            snd_nxt,
            rcv_nxt,
            rcv_acked,
            snd_gap: 0,
            rcv_gap: 0,
            ul_snd_una: snd_una.wrapping_sub(1),
            winsz,
            maxwinsz,
            peer_maxwinsz,
            ip_id: 0,
        }
    }

    /// Prepend IPv4 and GRE headers to `frame`. An empty frame makes an
    /// acknowledgement-only packet.
    fn build(&mut self, ids: SessionIds, frame: &[u8], has_seq: bool, has_ack: bool) -> Transmit {
        let hlen = IPV4_MIN_HEADER_SIZE + GRE_HEADER_LEN + 4 * (has_seq as usize + has_ack as usize);
        let total = hlen + frame.len();
        let mut dgram = vec![0u8; total];

        dgram[0] = 0x45;
        dgram[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        dgram[4..6].copy_from_slice(&self.ip_id.to_be_bytes());
        self.ip_id = self.ip_id.wrapping_add(1);
        dgram[8] = IP_TTL_MAX;
        dgram[9] = IPPROTO_GRE;
        dgram[12..16].copy_from_slice(&self.our_address.octets());
        dgram[16..20].copy_from_slice(&self.peer_address.octets());
        let cksum = ipv4_header_checksum(&dgram[..IPV4_MIN_HEADER_SIZE]);
        dgram[10..12].copy_from_slice(&cksum.to_be_bytes());

        let gre = IPV4_MIN_HEADER_SIZE;
        let mut flags = GRE_FLAG_K | GRE_VERSION;
        dgram[gre + GRE_TYPE_OFF..gre + GRE_TYPE_OFF + 2].copy_from_slice(&GRE_PROTOCOL_PPP.to_be_bytes());
        dgram[gre + GRE_LEN_OFF..gre + GRE_LEN_OFF + 2].copy_from_slice(&(frame.len() as u16).to_be_bytes());
        dgram[gre + GRE_CALL_ID_OFF..gre + GRE_CALL_ID_OFF + 2]
            .copy_from_slice(&ids.peer_session_id.to_be_bytes());

        let mut off = gre + GRE_HEADER_LEN;
        if has_seq {
            flags |= GRE_FLAG_S;
            put32(&mut dgram, off, self.snd_nxt);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_gap = self.snd_gap.wrapping_add(1);
            off += 4;
        }
        if has_ack {
            flags |= GRE_FLAG_A;
            self.rcv_acked = self.rcv_nxt;
            put32(&mut dgram, off, self.rcv_nxt.wrapping_sub(1));
        }
        dgram[gre..gre + 2].copy_from_slice(&flags.to_be_bytes());
        dgram[hlen..].copy_from_slice(frame);

        Transmit::Ipv4 {
            dst: self.peer_address,
            datagram: dgram,
        }
    }
}

impl TunnelCodec for PptpSession {
    fn decode(&mut self, packet: &[u8]) -> Result<Inbound, PacketError> {
        let (_, ihl, key) = lookup_key(packet)?;
        let has_seq = key.flags & GRE_FLAG_S != 0;
        let has_ack = key.flags & GRE_FLAG_A != 0;
        let hlen = ihl + GRE_HEADER_LEN + 4 * (has_seq as usize + has_ack as usize);
        if packet.len() < hlen {
            return Err(PacketError::PacketTooShort);
        }

        let mut inbound = Inbound::default();
        let mut off = ihl + GRE_HEADER_LEN;
        if has_seq {
            inbound.seq = Some(SeqField {
                offset: off,
                value: be32(packet, off),
            });
            off += 4;
        }
        if let Some(frame_len) = has_seq.then(|| be16(packet, ihl + GRE_LEN_OFF) as usize) {
            if frame_len < PPP_MIN_LEN {
                return Err(PacketError::IncorrectPacketLength);
            }
            inbound.frame = Some(frame_range(hlen, frame_len, packet)?);
        }

        if has_ack {
            let ack = be32(packet, off);
            inbound.ack = Some(SeqField { offset: off, value: ack });
            if ack.wrapping_add(1) == self.snd_una {
                // unchanged
            } else if seq32_lt(ack, self.snd_una) {
                tracing::debug!(
                    message = "Error: PPTP ack out of sequence",
                    ack,
                    snd_una = self.snd_una,
                    snd_nxt = self.snd_nxt
                );
                return Err(PacketError::AckOutOfSequence);
            } else if seq32_gt(ack, self.snd_nxt) {
                tracing::debug!(
                    message = "Error: PPTP ack for unknown sequence",
                    ack,
                    snd_una = self.snd_una,
                    snd_nxt = self.snd_nxt
                );
                return Err(PacketError::AckForUnknownSequence);
            } else {
                self.snd_una = ack.wrapping_add(1);
            }
        }

        let seq = match inbound.seq {
            Some(field) => field.value,
            None => return Ok(inbound),
        };

        match classify32(seq, self.rcv_nxt) {
            SeqPosition::Stale => {
                tracing::debug!(
                    message = "Error: PPTP data out of sequence",
                    seq,
                    rcv_nxt = self.rcv_nxt
                );
                return Err(PacketError::OutOfSequence);
            }
            SeqPosition::Rewind => inbound.rewind = true,
            SeqPosition::Advance(nseq) => {
                if seq32_sub(seq, self.rcv_nxt) >= self.maxwinsz as i32 {
                    tracing::debug!(
                        message = "PPTP window overflow",
                        seq,
                        rcv_nxt = self.rcv_nxt,
                        maxwinsz = self.maxwinsz,
                        lost = seq32_sub(seq, self.rcv_nxt)
                    );
                }
                inbound.advance = nseq;
                self.rcv_nxt = seq.wrapping_add(1);
            }
        }

        let half_window = ((self.winsz as u32 + 1) & !1) / 2;
        inbound.send_ack = seq32_sub(self.rcv_nxt, self.rcv_acked) > half_window as i32;
        Ok(inbound)
    }

    fn accept(&mut self, inbound: &Inbound) {
        if !inbound.rewind {
            self.rcv_gap = self.rcv_gap.wrapping_add(inbound.advance);
        }
    }

    fn restore(&mut self, inbound: &Inbound, packet: &mut [u8]) {
        if let Some(seq) = inbound.seq {
            put32(packet, seq.offset, seq.value.wrapping_sub(self.rcv_gap));
        }
        if let Some(ack) = inbound.ack {
            // With our own data still unacknowledged the shifted value may
            // land before userland's send window, so repeat the last one.
            if self.snd_nxt == self.snd_una {
                self.ul_snd_una = ack.value.wrapping_sub(self.snd_gap);
            }
            put32(packet, ack.offset, self.ul_snd_una);
        }
    }

    fn encode(&mut self, ids: SessionIds, frame: &[u8]) -> Transmit {
        self.build(ids, frame, true, true)
    }

    fn ack(&mut self, ids: SessionIds) -> Option<Transmit> {
        Some(self.build(ids, &[], false, true))
    }

    fn userland_output(&mut self, gre: &mut [u8]) -> Result<(), PacketError> {
        let key = parse_gre(gre)?;
        let has_seq = key.flags & GRE_FLAG_S != 0;
        let has_ack = key.flags & GRE_FLAG_A != 0;
        if gre.len() < GRE_HEADER_LEN + 4 * (has_seq as usize + has_ack as usize) {
            return Err(PacketError::PacketTooShort);
        }

        let mut off = GRE_HEADER_LEN;
        if has_seq {
            let seq = be32(gre, off).wrapping_add(self.snd_gap);
            put32(gre, off, seq);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            off += 4;
        }
        if has_ack {
            let ack = be32(gre, off).wrapping_add(self.rcv_gap);
            put32(gre, off, ack);
            if seq32_gt(ack, self.rcv_acked) {
                self.rcv_acked = ack;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const OURS: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 254);

    fn session() -> PptpSession {
        PptpSession::new(PEER, OURS, 1, 1, 100, 100, 64, 64, 64)
    }

    fn ids() -> SessionIds {
        SessionIds {
            session_id: 10,
            peer_session_id: 20,
        }
    }

    /// A datagram from the peer as it would arrive on the GRE socket.
    fn datagram(seq: Option<u32>, ack: Option<u32>, ppp: &[u8]) -> Vec<u8> {
        let mut gre = vec![0u8; GRE_HEADER_LEN];
        let mut flags = GRE_FLAG_K | GRE_VERSION;
        gre[2..4].copy_from_slice(&GRE_PROTOCOL_PPP.to_be_bytes());
        gre[4..6].copy_from_slice(&(ppp.len() as u16).to_be_bytes());
        gre[6..8].copy_from_slice(&10u16.to_be_bytes());
        if let Some(seq) = seq {
            flags |= GRE_FLAG_S;
            gre.extend_from_slice(&seq.to_be_bytes());
        }
        if let Some(ack) = ack {
            flags |= GRE_FLAG_A;
            gre.extend_from_slice(&ack.to_be_bytes());
        }
        gre[0..2].copy_from_slice(&flags.to_be_bytes());
        gre.extend_from_slice(ppp);

        let ip = etherparse::Ipv4Header::new(gre.len() as u16, 64, IPPROTO_GRE, PEER.octets(), OURS.octets());
        let mut out = Vec::new();
        ip.write(&mut out).unwrap();
        out.extend_from_slice(&gre);
        out
    }

    const IP_FRAME: [u8; 8] = [0xff, 0x03, 0x00, 0x21, 0x45, 0x00, 0x00, 0x14];

    #[test]
    fn lookup_validates_header() {
        let d = datagram(Some(100), None, &IP_FRAME);
        let (src, ihl, key) = lookup_key(&d).unwrap();
        assert_eq!(src, PEER);
        assert_eq!(ihl, 20);
        assert_eq!(key.call_id, 10);

        let mut bad = d.clone();
        bad[20 + 1] &= !0x07;
        assert_eq!(lookup_key(&bad), Err(PacketError::WrongVersion));

        let mut bad = d;
        bad[20] &= !0x20;
        assert_eq!(lookup_key(&bad).unwrap_err(), PacketError::MissingKeyFlag);
    }

    #[test]
    fn in_sequence_data_advances() {
        let mut s = session();
        let d = datagram(Some(100), None, &IP_FRAME);
        let inbound = s.decode(&d).unwrap();
        assert_eq!(inbound.frame, Some(32..40));
        assert_eq!(inbound.advance, 1);
        assert!(!inbound.rewind);
        s.accept(&inbound);
        assert_eq!(s.rcv_nxt, 101);
        assert_eq!(s.rcv_gap, 1);
    }

    #[test]
    fn rewind_window() {
        let mut s = session();
        s.rcv_nxt = 200;
        s.rcv_acked = 200;

        // One behind the edge is delivered without moving anything.
        let inbound = s.decode(&datagram(Some(199), None, &IP_FRAME)).unwrap();
        assert!(inbound.rewind);
        s.accept(&inbound);
        assert_eq!(s.rcv_nxt, 200);
        assert_eq!(s.rcv_gap, 0);

        // Sixty five behind is dropped.
        assert_eq!(
            s.decode(&datagram(Some(135), None, &IP_FRAME)),
            Err(PacketError::OutOfSequence)
        );
    }

    #[test]
    fn ack_validation() {
        let mut s = session();
        s.snd_una = 10;
        s.snd_nxt = 15;

        // Unchanged ack.
        s.decode(&datagram(None, Some(9), &[])).unwrap();
        assert_eq!(s.snd_una, 10);

        assert_eq!(
            s.decode(&datagram(None, Some(5), &[])),
            Err(PacketError::AckOutOfSequence)
        );
        assert_eq!(
            s.decode(&datagram(None, Some(16), &[])),
            Err(PacketError::AckForUnknownSequence)
        );

        let inbound = s.decode(&datagram(None, Some(12), &[])).unwrap();
        assert_eq!(s.snd_una, 13);
        assert!(inbound.frame.is_none());
    }

    #[test]
    fn ack_sent_after_half_window() {
        let mut s = session();
        s.winsz = 4;
        let first = s.decode(&datagram(Some(100), None, &IP_FRAME)).unwrap();
        assert!(!first.send_ack);
        s.accept(&first);
        let second = s.decode(&datagram(Some(101), None, &IP_FRAME)).unwrap();
        assert!(!second.send_ack);
        s.accept(&second);
        let third = s.decode(&datagram(Some(102), None, &IP_FRAME)).unwrap();
        assert!(third.send_ack);

        match s.ack(ids()).unwrap() {
            Transmit::Ipv4 { dst, datagram } => {
                assert_eq!(dst, PEER);
                assert_eq!(datagram.len(), 20 + 8 + 4);
                let flags = be16(&datagram, 20);
                assert_eq!(flags & GRE_FLAG_S, 0);
                assert_ne!(flags & GRE_FLAG_A, 0);
                assert_eq!(be32(&datagram, 28), 102);
            }
            other => panic!("unexpected transmit {:?}", other),
        }
        assert_eq!(s.rcv_acked, 103);
    }

    #[test]
    fn userland_sees_its_own_sequence_space() {
        let mut s = session();
        // Fast path took two packets.
        for seq in 100..102 {
            let inbound = s.decode(&datagram(Some(seq), None, &IP_FRAME)).unwrap();
            s.accept(&inbound);
        }

        // A control frame (LCP) is not ours and is shifted back by the gap.
        let lcp = [0xff, 0x03, 0xc0, 0x21, 0x09, 0x01, 0x00, 0x08];
        let mut d = datagram(Some(102), Some(0), &lcp);
        let inbound = s.decode(&d).unwrap();
        s.restore(&inbound, &mut d);
        assert_eq!(be32(&d, 28), 100);
        // Nothing in flight from us, so the ack is relative to the send gap.
        assert_eq!(be32(&d, 32), 0);
        assert_eq!(s.ul_snd_una, 0);
    }

    #[test]
    fn output_headers() {
        let mut s = session();
        let frame = [0xff, 0x03, 0x00, 0x21, 0x45];
        let Transmit::Ipv4 { datagram, .. } = s.encode(ids(), &frame) else {
            panic!("expected an IPv4 datagram");
        };

        let (ip, rest) = etherparse::Ipv4Header::from_slice(&datagram).unwrap();
        assert_eq!(ip.protocol, IPPROTO_GRE);
        assert_eq!(ip.time_to_live, 255);
        assert_eq!(ip.source, OURS.octets());
        assert_eq!(ip.destination, PEER.octets());
        assert_eq!(ip.header_checksum, ip.calc_header_checksum().unwrap());

        assert_eq!(be16(rest, 0), GRE_FLAG_K | GRE_VERSION | GRE_FLAG_S | GRE_FLAG_A);
        assert_eq!(be16(rest, 4), frame.len() as u16);
        assert_eq!(be16(rest, 6), 20);
        assert_eq!(be32(rest, 8), 1);
        assert_eq!(be32(rest, 12), 99);
        assert_eq!(&rest[16..], &frame);
        assert_eq!((s.snd_nxt, s.snd_gap), (2, 1));
    }

    #[test]
    fn userland_output_shifts_into_wire_space() {
        let mut s = session();
        s.encode(ids(), &IP_FRAME);
        s.encode(ids(), &IP_FRAME);
        s.rcv_gap = 3;

        let mut gre = vec![0u8; 16];
        gre[0..2].copy_from_slice(&(GRE_FLAG_K | GRE_VERSION | GRE_FLAG_S | GRE_FLAG_A).to_be_bytes());
        gre[2..4].copy_from_slice(&GRE_PROTOCOL_PPP.to_be_bytes());
        gre[6..8].copy_from_slice(&20u16.to_be_bytes());
        gre[8..12].copy_from_slice(&1u32.to_be_bytes());
        gre[12..16].copy_from_slice(&99u32.to_be_bytes());
        s.userland_output(&mut gre).unwrap();

        assert_eq!(be32(&gre, 8), 3);
        assert_eq!(be32(&gre, 12), 102);
        assert_eq!(s.snd_nxt, 4);
        assert_eq!(s.rcv_acked, 102);
    }
}
